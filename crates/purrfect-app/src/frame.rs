//! Per-frame context for rendering.

use ash::vk;

/// Context for the frame being recorded.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Command buffer for recording rendering commands.
    pub command_buffer: vk::CommandBuffer,
    /// Index of the acquired chain image.
    pub image_index: u32,
    /// Frame-in-flight slot.
    pub slot: usize,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    pub frame_number: u64,
    pub extent: vk::Extent2D,
}

impl FrameContext {
    pub(crate) fn new(frame: &purrfect_gpu::FrameContext, dt: f32) -> Self {
        Self {
            command_buffer: frame.command_buffer,
            image_index: frame.image_index,
            slot: frame.slot,
            dt,
            frame_number: frame.frame_number,
            extent: frame.extent,
        }
    }

    /// Width over height of the render area.
    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height.max(1) as f32
    }
}
