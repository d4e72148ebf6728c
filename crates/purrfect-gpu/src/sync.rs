//! Synchronization primitives and per-frame slot resources.

use crate::command::CommandExecutor;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    device
        .create_semaphore(&create_info, None)
        .call("vkCreateSemaphore")
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    device.create_fence(&create_info, None).call("vkCreateFence")
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    device
        .wait_for_fences(&[fence], true, timeout_ns)
        .call("vkWaitForFences")
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence]).call("vkResetFences")
}

/// Resources owned by one frame-in-flight slot.
pub struct FrameSlot {
    /// Signaled when the acquired chain image is ready.
    pub image_available: vk::Semaphore,
    /// Signaled when the slot's submission finished rendering.
    pub render_finished: vk::Semaphore,
    /// Signaled when the GPU is done with the slot. Created signaled.
    pub in_flight: vk::Fence,
    /// Pre-allocated primary command buffer.
    pub command_buffer: vk::CommandBuffer,
}

impl FrameSlot {
    /// # Safety
    /// The device must be valid.
    unsafe fn new(device: &ash::Device, command_buffer: vk::CommandBuffer) -> Result<Self> {
        Ok(Self {
            image_available: create_semaphore(device)?,
            render_finished: create_semaphore(device)?,
            in_flight: create_fence(device, true)?,
            command_buffer,
        })
    }

    /// Block until the GPU releases this slot.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device) -> Result<()> {
        wait_for_fence(device, self.in_flight, u64::MAX)
    }

    /// Unsignal the fence and reset the command buffer for recording.
    ///
    /// # Safety
    /// The fence must be signaled.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        reset_fence(device, self.in_flight)?;
        device
            .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
            .call("vkResetCommandBuffer")
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_fence(self.in_flight, None);
    }
}

/// The fixed set of frame-in-flight slots.
pub struct FrameSlots {
    slots: Vec<FrameSlot>,
}

impl FrameSlots {
    /// Create `count` slots, each with its own command buffer from
    /// `executor`'s pool.
    ///
    /// # Safety
    /// The device must be the one `executor` was created on.
    pub unsafe fn new(
        device: &ash::Device,
        executor: &CommandExecutor,
        count: usize,
    ) -> Result<Self> {
        let command_buffers = executor.allocate(count as u32)?;
        let mut slots = Vec::with_capacity(count);
        for command_buffer in command_buffers {
            slots.push(FrameSlot::new(device, command_buffer)?);
        }

        tracing::debug!("Created {} frame slots", slots.len());
        Ok(Self { slots })
    }

    pub fn get(&self, index: usize) -> Result<&FrameSlot> {
        self.slots
            .get(index)
            .ok_or_else(|| GpuError::InvalidState(format!("no frame slot {index}")))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Destroy all semaphores and fences. Command buffers go with the pool.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for slot in &self.slots {
            slot.destroy(device);
        }
    }
}
