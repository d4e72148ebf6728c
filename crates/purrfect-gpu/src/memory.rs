//! GPU memory management.
//!
//! Buffers and images are allocated through `gpu-allocator`. Host writes go
//! through a scoped [`BufferMapping`], which is the only way to reach a
//! buffer's host pointer.

use crate::command::CommandExecutor;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::marker::PhantomData;
use std::sync::Arc;

/// Map Vulkan memory property flags onto an allocator memory location.
///
/// Host-visible memory is persistently mapped by the allocator; host-cached
/// memory is treated as a readback target.
pub fn memory_location(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
    if !properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        MemoryLocation::GpuOnly
    } else if properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else {
        MemoryLocation::CpuToGpu
    }
}

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn inner(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Allocate a buffer.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        if size == 0 {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{name}' must not be empty"
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .call("vkCreateBuffer")?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory_location(properties),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .call("vkBindBufferMemory")?;
        }

        tracing::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, usage);

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            properties,
        })
    }

    /// Free a buffer allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Allocate an image.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        let image = unsafe {
            self.device
                .create_image(create_info, None)
                .call("vkCreateImage")?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self
            .inner()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .call("vkBindImageMemory")?;
        }

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
            mip_levels: create_info.mip_levels,
            array_layers: create_info.array_layers,
            samples: create_info.samples,
        })
    }

    /// Free an image allocation.
    pub fn free_image(&mut self, image: &mut GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.inner()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub properties: vk::MemoryPropertyFlags,
}

impl GpuBuffer {
    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Whether the host can map this buffer.
    pub fn is_host_visible(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Open a scoped host mapping.
    ///
    /// The mapping borrows the buffer mutably, so at most one mapping exists at
    /// a time and the buffer cannot be freed while it is open.
    pub fn map(&mut self) -> Result<BufferMapping<'_>> {
        let size = self.size;
        let ptr = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("Buffer is not host visible".to_string()))?;

        Ok(BufferMapping {
            ptr,
            size,
            _buffer: PhantomData,
        })
    }

    /// Record and submit a device-side copy of `src` into this buffer.
    ///
    /// Both buffers must have the same size.
    pub fn copy_from(&self, executor: &mut CommandExecutor, src: &GpuBuffer) -> Result<()> {
        if src.size != self.size {
            return Err(GpuError::InvalidState(format!(
                "Buffer copy size mismatch: source is {} bytes, destination is {} bytes",
                src.size, self.size
            )));
        }
        executor.copy_buffer(src.buffer, self.buffer, self.size)
    }
}

/// Scoped host mapping of a [`GpuBuffer`].
///
/// Allocations made through `gpu-allocator` stay persistently mapped; the
/// mapping object only scopes host access.
pub struct BufferMapping<'a> {
    ptr: *mut u8,
    size: u64,
    _buffer: PhantomData<&'a mut GpuBuffer>,
}

impl BufferMapping<'_> {
    /// Size of the mapped range in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy exactly `size` bytes into the buffer, closing the mapping.
    pub fn set_data<T: bytemuck::Pod>(self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 != self.size {
            return Err(GpuError::InvalidState(format!(
                "set_data expects {} bytes, got {}",
                self.size,
                bytes.len()
            )));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr, bytes.len());
        }
        Ok(())
    }

    /// View the mapped contents.
    pub fn read(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size as usize) }
    }
}

/// A GPU image with its allocation.
pub struct GpuImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_local_maps_to_gpu_only() {
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::empty()),
            MemoryLocation::GpuOnly
        );
    }

    #[test]
    fn host_visible_maps_to_upload_heap() {
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL
            ),
            MemoryLocation::CpuToGpu
        );
    }

    #[test]
    fn host_cached_maps_to_readback_heap() {
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            ),
            MemoryLocation::GpuToCpu
        );
    }

    #[test]
    fn mapping_requires_exact_size() {
        let mut backing = [0u8; 8];
        let mapping = BufferMapping {
            ptr: backing.as_mut_ptr(),
            size: 8,
            _buffer: PhantomData,
        };
        let err = mapping.set_data(&[1u8, 2, 3]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));

        let mapping = BufferMapping {
            ptr: backing.as_mut_ptr(),
            size: 8,
            _buffer: PhantomData,
        };
        mapping.set_data(&[1.5f32, -2.0]).unwrap();
        assert_eq!(&backing[..4], &1.5f32.to_ne_bytes());
        assert_eq!(&backing[4..], &(-2.0f32).to_ne_bytes());
    }

    #[test]
    fn mapping_reads_back_contents() {
        let mut backing = [7u8, 8, 9, 10];
        let mapping = BufferMapping {
            ptr: backing.as_mut_ptr(),
            size: 4,
            _buffer: PhantomData,
        };
        assert_eq!(mapping.read(), &[7, 8, 9, 10]);
        assert_eq!(mapping.size(), 4);
    }
}
