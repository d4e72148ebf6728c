//! GPU capability detection and device scoring.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Physical device type (discrete, integrated, ...)
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Largest supported 2D image dimension
    pub max_image_dimension_2d: u32,
    /// Highest sample count usable for both color and depth framebuffer attachments
    pub max_msaa_samples: vk::SampleCountFlags,
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let limits = &properties.limits;

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            max_image_dimension_2d: limits.max_image_dimension2_d,
            max_msaa_samples: max_usable_sample_count(
                limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts,
            ),
            max_sampler_anisotropy: limits.max_sampler_anisotropy,

            device_local_memory_mb,
            available_extensions,
        }
    }

    /// Check whether a device extension is available.
    pub fn supports_extension(&self, name: &CStr) -> bool {
        name.to_str()
            .map(|name| self.available_extensions.contains(name))
            .unwrap_or(false)
    }

    /// Selection score for this device; higher is better.
    pub fn score(&self) -> u64 {
        device_type_bonus(self.device_type)
            + u64::from(self.max_image_dimension_2d)
            + u64::from(sample_count_value(self.max_msaa_samples))
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{} - {} MB VRAM - {}x MSAA",
            self.device_name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            sample_count_value(self.max_msaa_samples),
        )
    }
}

/// Score bonus for the kind of device.
pub fn device_type_bonus(device_type: vk::PhysicalDeviceType) -> u64 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    }
}

/// Highest single sample count contained in `counts`.
pub fn max_usable_sample_count(counts: vk::SampleCountFlags) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&candidate| counts.contains(candidate))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Numeric sample count of a single-bit sample flag.
pub fn sample_count_value(samples: vk::SampleCountFlags) -> u32 {
    // Sample count flags are defined so that the bit value equals the count.
    samples.as_raw().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(
        device_type: vk::PhysicalDeviceType,
        dim: u32,
        samples: vk::SampleCountFlags,
    ) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".to_string(),
            device_type,
            api_version: vk::API_VERSION_1_2,
            driver_version: 0,
            max_image_dimension_2d: dim,
            max_msaa_samples: samples,
            max_sampler_anisotropy: 16.0,
            device_local_memory_mb: 4096,
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn score_sums_bonus_dimension_and_samples() {
        let discrete = caps(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            16384,
            vk::SampleCountFlags::TYPE_8,
        );
        assert_eq!(discrete.score(), 1000 + 16384 + 8);

        let cpu = caps(vk::PhysicalDeviceType::CPU, 8192, vk::SampleCountFlags::TYPE_1);
        assert_eq!(cpu.score(), 8192 + 1);
    }

    #[test]
    fn discrete_beats_integrated_with_equal_limits() {
        let discrete = caps(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            16384,
            vk::SampleCountFlags::TYPE_4,
        );
        let integrated = caps(
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            16384,
            vk::SampleCountFlags::TYPE_4,
        );
        assert!(discrete.score() > integrated.score());
    }

    #[test]
    fn max_sample_count_picks_highest_bit() {
        let counts = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        assert_eq!(max_usable_sample_count(counts), vk::SampleCountFlags::TYPE_8);
        assert_eq!(
            max_usable_sample_count(vk::SampleCountFlags::TYPE_1),
            vk::SampleCountFlags::TYPE_1
        );
        assert_eq!(
            max_usable_sample_count(vk::SampleCountFlags::empty()),
            vk::SampleCountFlags::TYPE_1
        );
    }

    #[test]
    fn sample_count_values() {
        assert_eq!(sample_count_value(vk::SampleCountFlags::TYPE_1), 1);
        assert_eq!(sample_count_value(vk::SampleCountFlags::TYPE_16), 16);
        assert_eq!(sample_count_value(vk::SampleCountFlags::empty()), 1);
    }

    #[test]
    fn extension_lookup() {
        let mut c = caps(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            1,
            vk::SampleCountFlags::TYPE_1,
        );
        c.available_extensions.insert("VK_KHR_swapchain".to_string());
        assert!(c.supports_extension(ash::khr::swapchain::NAME));
        assert!(!c.supports_extension(c"VK_KHR_ray_query"));
    }
}
