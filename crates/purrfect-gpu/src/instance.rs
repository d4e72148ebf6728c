//! Vulkan instance creation, validation messenger and device selection.

use crate::capabilities::GpuCapabilities;
use crate::context::QueueFamilyIndices;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use std::ffi::{c_char, c_void, CStr, CString};

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Device extensions every presenting device must expose.
pub fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Create a Vulkan instance.
///
/// `surface_extensions` are the platform surface extensions reported by the
/// windowing system; pass an empty slice for a headless instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point and every extension pointer
/// must reference a NUL-terminated string that outlives this call.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    surface_extensions: &[*const c_char],
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Purrfect")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extension_names: Vec<*const c_char> = surface_extensions.to_vec();
    if enable_validation {
        extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    #[cfg(target_os = "macos")]
    extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    let available_layers = entry
        .enumerate_instance_layer_properties()
        .call("vkEnumerateInstanceLayerProperties")?;
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();

    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    entry
        .create_instance(&create_info, None)
        .call("vkCreateInstance")
}

/// Validation-layer messenger that forwards driver messages into `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Install the messenger on an instance created with validation enabled.
    ///
    /// # Safety
    /// The instance must have been created with `VK_EXT_debug_utils` enabled.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = loader
            .create_debug_utils_messenger(&create_info, None)
            .call("vkCreateDebugUtilsMessengerEXT")?;

        Ok(Self { loader, messenger })
    }

    /// Destroy the messenger.
    ///
    /// # Safety
    /// Must be called before the owning instance is destroyed.
    pub unsafe fn destroy(&self) {
        self.loader.destroy_debug_utils_messenger(self.messenger, None);
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", ?types, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", ?types, "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::debug!(target: "vulkan", ?types, "{message}");
    } else {
        tracing::trace!(target: "vulkan", ?types, "{message}");
    }

    vk::FALSE
}

/// Surface the selected device has to present to.
#[derive(Clone, Copy)]
pub struct SurfaceProbe<'a> {
    pub loader: &'a ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
}

/// Outcome of physical device selection.
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub capabilities: GpuCapabilities,
    pub queue_families: QueueFamilyIndices,
}

/// Select the highest-scoring suitable physical device.
///
/// A device qualifies when it exposes a graphics queue family and, if a
/// surface is given, a family that can present to it, the swapchain
/// extension and non-empty format and present-mode lists.
///
/// # Safety
/// The instance and surface must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<SurfaceProbe<'_>>,
) -> Result<SelectedDevice> {
    let devices = instance
        .enumerate_physical_devices()
        .call("vkEnumeratePhysicalDevices")?;

    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }

    let mut best: Option<(u64, SelectedDevice)> = None;
    let mut missing_extension: Option<String> = None;

    for physical_device in devices {
        let capabilities = GpuCapabilities::query(instance, physical_device);

        let Some(queue_families) = find_queue_families(instance, physical_device, surface)? else {
            tracing::debug!("Skipping {}: missing queue families", capabilities.device_name);
            continue;
        };

        if let Some(probe) = surface {
            if let Some(missing) = required_device_extensions()
                .into_iter()
                .find(|ext| !capabilities.supports_extension(ext))
            {
                tracing::debug!(
                    "Skipping {}: missing extension {:?}",
                    capabilities.device_name,
                    missing
                );
                missing_extension = Some(missing.to_string_lossy().into_owned());
                continue;
            }

            let formats = probe
                .loader
                .get_physical_device_surface_formats(physical_device, probe.surface)
                .call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
            let present_modes = probe
                .loader
                .get_physical_device_surface_present_modes(physical_device, probe.surface)
                .call("vkGetPhysicalDeviceSurfacePresentModesKHR")?;
            if formats.is_empty() || present_modes.is_empty() {
                tracing::debug!(
                    "Skipping {}: surface reports no formats or present modes",
                    capabilities.device_name
                );
                continue;
            }
        }

        let score = capabilities.score();
        tracing::debug!("Candidate GPU {} scored {}", capabilities.device_name, score);

        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            best = Some((
                score,
                SelectedDevice {
                    physical_device,
                    capabilities,
                    queue_families,
                },
            ));
        }
    }

    best.map(|(_, selected)| selected)
        .ok_or_else(|| no_device_error(missing_extension))
}

/// Error for a selection that found no device, naming a missing required
/// extension when that is what ruled devices out.
fn no_device_error(missing_extension: Option<String>) -> GpuError {
    match missing_extension {
        Some(extension) => GpuError::ExtensionNotSupported(extension),
        None => GpuError::NoSuitableDevice,
    }
}

/// Query queue family support for a device.
///
/// # Safety
/// The instance, physical device and surface must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<SurfaceProbe<'_>>,
) -> Result<Option<QueueFamilyIndices>> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut present_support = Vec::with_capacity(families.len());
    for index in 0..families.len() as u32 {
        let supported = match surface {
            Some(probe) => probe
                .loader
                .get_physical_device_surface_support(physical_device, index, probe.surface)
                .call("vkGetPhysicalDeviceSurfaceSupportKHR")?,
            // Headless: presentation is never exercised, any graphics family will do.
            None => families[index as usize]
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS),
        };
        present_support.push(supported);
    }

    let flags: Vec<vk::QueueFlags> = families.iter().map(|f| f.queue_flags).collect();
    Ok(QueueFamilyIndices::resolve(&flags, &present_support))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_extension_is_named_when_nothing_qualifies() {
        let err = no_device_error(Some("VK_KHR_swapchain".to_string()));
        assert!(matches!(&err, GpuError::ExtensionNotSupported(name) if name == "VK_KHR_swapchain"));
        assert!(err.to_string().contains("VK_KHR_swapchain"));
    }

    #[test]
    fn no_candidates_is_no_suitable_device() {
        assert!(matches!(no_device_error(None), GpuError::NoSuitableDevice));
    }

    #[test]
    fn presenting_devices_need_the_swapchain() {
        assert!(required_device_extensions().contains(&ash::khr::swapchain::NAME));
    }
}
