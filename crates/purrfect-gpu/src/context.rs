//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::{
    create_instance, required_device_extensions, select_physical_device, DebugMessenger,
    SelectedDevice, SurfaceProbe,
};
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};
use crate::surface::{create_surface, PresentationSurface, SurfaceContext};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::HasDisplayHandle;
use std::collections::BTreeSet;
use std::ffi::c_char;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static CONTEXT_ALIVE: AtomicBool = AtomicBool::new(false);

/// Marks the single live context; released when the context is dropped.
struct ContextToken;

impl ContextToken {
    fn acquire() -> Result<Self> {
        if CONTEXT_ALIVE.swap(true, Ordering::AcqRel) {
            return Err(GpuError::InvalidState(
                "a GpuContext already exists in this process".to_string(),
            ));
        }
        Ok(Self)
    }
}

impl Drop for ContextToken {
    fn drop(&mut self) {
        CONTEXT_ALIVE.store(false, Ordering::Release);
    }
}

/// Main GPU context holding Vulkan resources.
///
/// Exactly one context may exist per process; building a second one while
/// the first is alive fails with [`GpuError::InvalidState`].
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) debug_messenger: Option<DebugMessenger>,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,

    pub(crate) queue_families: QueueFamilyIndices,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,

    _token: ContextToken,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the device for long-lived helpers.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Whether the validation messenger is installed.
    pub fn has_debug_messenger(&self) -> bool {
        self.debug_messenger.is_some()
    }

    /// Resolved queue family indices.
    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the present queue (may be the graphics queue).
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.queue_families.graphics
    }

    /// Get the present queue family index.
    pub fn present_queue_family(&self) -> u32 {
        self.queue_families.present
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Allocate a buffer with the given memory properties.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.allocator
            .lock()
            .create_buffer(size, usage, properties, name)
    }

    /// Free a buffer and its allocation.
    pub fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        self.allocator.lock().free_buffer(buffer)
    }

    /// Allocate a device-local image.
    pub fn create_image(&self, create_info: &vk::ImageCreateInfo, name: &str) -> Result<GpuImage> {
        self.allocator
            .lock()
            .create_image(create_info, MemoryLocation::GpuOnly, name)
    }

    /// Free an image and its allocation.
    pub fn free_image(&self, image: &mut GpuImage) -> Result<()> {
        self.allocator.lock().free_image(image)
    }

    /// Query format features for a format.
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// First candidate format supporting `features` with the given tiling.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format> {
        candidates
            .iter()
            .copied()
            .find(|&format| {
                let props = self.format_properties(format);
                match tiling {
                    vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                    _ => props.optimal_tiling_features.contains(features),
                }
            })
            .ok_or_else(|| GpuError::Other(format!("No candidate format supports {features:?}")))
    }

    /// Best available depth attachment format.
    pub fn depth_format(&self) -> Result<vk::Format> {
        self.find_supported_format(
            &[
                vk::Format::D32_SFLOAT,
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT,
            ],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle().call("vkDeviceWaitIdle") }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::warn!("vkDeviceWaitIdle failed during teardown: {e}");
            }

            // Shutdown allocator BEFORE destroying device
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            if let Some(messenger) = self.debug_messenger.take() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
        tracing::debug!("GPU context destroyed");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Purrfect".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build a headless context without presentation support.
    ///
    /// The present queue aliases the graphics queue.
    pub fn build(self) -> Result<GpuContext> {
        let token = ContextToken::acquire()?;
        let (entry, instance, debug_messenger) = self.create_instance(&[])?;

        let selected = unsafe { select_physical_device(&instance, None) }?;
        self.finish(entry, instance, debug_messenger, selected, false, token)
    }

    /// Build a context able to present to `window`, returning the surface
    /// alongside it.
    pub fn build_for_surface<W>(self, window: &W) -> Result<(GpuContext, SurfaceContext)>
    where
        W: PresentationSurface + ?Sized,
    {
        let token = ContextToken::acquire()?;

        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let surface_extensions = ash_window::enumerate_required_extensions(display.as_raw())
            .call("vkEnumerateInstanceExtensionProperties")?;

        let (entry, instance, debug_messenger) = self.create_instance(surface_extensions)?;

        let surface = unsafe { create_surface(&entry, &instance, window) }?;
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let probe = SurfaceProbe {
            loader: &surface_loader,
            surface,
        };
        let selected = match unsafe { select_physical_device(&instance, Some(probe)) } {
            Ok(selected) => selected,
            Err(e) => {
                unsafe {
                    surface_loader.destroy_surface(surface, None);
                }
                return Err(e);
            }
        };

        let gpu = self.finish(entry, instance, debug_messenger, selected, true, token)?;
        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());
        let surface = SurfaceContext::new(surface, surface_loader, swapchain_loader);

        Ok((gpu, surface))
    }

    fn create_instance(
        &self,
        surface_extensions: &[*const c_char],
    ) -> Result<(ash::Entry, ash::Instance, Option<DebugMessenger>)> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.enable_validation,
                surface_extensions,
            )
        }?;

        let debug_messenger = if self.enable_validation {
            Some(unsafe { DebugMessenger::new(&entry, &instance) }?)
        } else {
            None
        };

        Ok((entry, instance, debug_messenger))
    }

    fn finish(
        &self,
        entry: ash::Entry,
        instance: ash::Instance,
        debug_messenger: Option<DebugMessenger>,
        selected: SelectedDevice,
        presenting: bool,
        token: ContextToken,
    ) -> Result<GpuContext> {
        let SelectedDevice {
            physical_device,
            capabilities,
            queue_families,
        } = selected;

        tracing::info!("Selected GPU: {}", capabilities.summary());
        tracing::debug!(
            "Queue families: graphics={}, present={}",
            queue_families.graphics,
            queue_families.present
        );

        let (device, graphics_queue, present_queue) =
            unsafe { create_device(&instance, physical_device, queue_families, presenting)? };

        let device = Arc::new(device);

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            debug_messenger,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            queue_families,
            graphics_queue,
            present_queue,
            _token: token,
        })
    }
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Resolve graphics and present families from per-family capability flags
    /// and present support.
    ///
    /// Takes the first graphics-capable family and the first present-capable
    /// family, which may coincide. Returns `None` unless both exist.
    pub fn resolve(flags: &[vk::QueueFlags], present_support: &[bool]) -> Option<Self> {
        let mut graphics = None;
        let mut present = None;

        for (i, family_flags) in flags.iter().enumerate() {
            let i = i as u32;

            if family_flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
                graphics = Some(i);
            }
            if present_support.get(i as usize).copied().unwrap_or(false) && present.is_none() {
                present = Some(i);
            }
            if graphics.is_some() && present.is_some() {
                break;
            }
        }

        Some(Self {
            graphics: graphics?,
            present: present?,
        })
    }

    /// Whether graphics and present use different families.
    pub fn is_split(&self) -> bool {
        self.graphics != self.present
    }

    /// Distinct family indices, in ascending order.
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present].into_iter().collect();
        set.into_iter().collect()
    }
}

/// Create the logical device and retrieve queues.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: QueueFamilyIndices,
    presenting: bool,
) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions = if presenting {
        required_device_extensions()
    } else {
        Vec::new()
    };
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .call("vkCreateDevice")?;

    let graphics_queue = device.get_device_queue(queue_families.graphics, 0);
    let present_queue = device.get_device_queue(queue_families.present, 0);

    Ok((device, graphics_queue, present_queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    #[test]
    fn single_family_serves_both() {
        let families = QueueFamilyIndices::resolve(&[G | C | T], &[true]).unwrap();
        assert_eq!(
            families,
            QueueFamilyIndices {
                graphics: 0,
                present: 0
            }
        );
        assert!(!families.is_split());
        assert_eq!(families.unique(), vec![0]);
    }

    #[test]
    fn distinct_present_family() {
        let families = QueueFamilyIndices::resolve(&[G | C, T, C], &[false, false, true]).unwrap();
        assert_eq!(families.graphics, 0);
        assert_eq!(families.present, 2);
        assert!(families.is_split());
        assert_eq!(families.unique(), vec![0, 2]);
    }

    #[test]
    fn first_capable_family_wins() {
        let families = QueueFamilyIndices::resolve(&[C, G, G], &[false, true, true]).unwrap();
        assert_eq!(families.graphics, 1);
        assert_eq!(families.present, 1);
    }

    #[test]
    fn missing_graphics_or_present_is_unsuitable() {
        assert!(QueueFamilyIndices::resolve(&[C | T], &[true]).is_none());
        assert!(QueueFamilyIndices::resolve(&[G], &[false]).is_none());
        assert!(QueueFamilyIndices::resolve(&[], &[]).is_none());
    }

    #[test]
    fn short_present_list_counts_as_unsupported() {
        assert!(QueueFamilyIndices::resolve(&[G, G], &[]).is_none());
    }
}
