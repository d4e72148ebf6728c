//! Command buffer management.
//!
//! [`CommandExecutor`] owns the graphics command pool. Besides handing out
//! per-frame command buffers it runs one-shot transfer work synchronously:
//! record, submit, wait for the queue to drain, free. Those helpers take
//! `&mut self`, so a single executor cannot be driven from two threads at once.

use crate::context::GpuContext;
use crate::error::{GpuError, Result, VkResultExt};
use crate::transition::{aspect_mask, record_transition};
use ash::vk;
use std::sync::Arc;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device
            .create_command_pool(&create_info, None)
            .call("vkCreateCommandPool")?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        device
            .allocate_command_buffers(&alloc_info)
            .call("vkAllocateCommandBuffers")
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device
        .begin_command_buffer(cmd, &begin_info)
        .call("vkBeginCommandBuffer")
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd).call("vkEndCommandBuffer")
}

/// Submit a command buffer to a queue.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffer(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let command_buffers = [cmd];
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(&command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    device
        .queue_submit(queue, &[submit_info], fence)
        .call("vkQueueSubmit")
}

/// Number of mip levels in a full chain for an image of the given size.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Whether a format's optimal-tiling features allow linear-filtered blits.
pub fn supports_linear_blit(features: vk::FormatFeatureFlags) -> bool {
    features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
}

/// Graphics command pool plus synchronous one-shot submission.
pub struct CommandExecutor {
    device: Arc<ash::Device>,
    pool: CommandPool,
    queue: vk::Queue,
}

impl CommandExecutor {
    /// Create a resettable command pool on the graphics queue family.
    pub fn new(gpu: &GpuContext) -> Result<Self> {
        let device = gpu.device_arc();
        let pool = unsafe {
            CommandPool::new(
                &device,
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        }?;

        tracing::debug!("Command pool created on queue family {}", pool.queue_family());

        Ok(Self {
            device,
            pool,
            queue: gpu.graphics_queue(),
        })
    }

    /// Get the raw pool handle.
    pub fn pool(&self) -> vk::CommandPool {
        self.pool.handle()
    }

    /// Queue that one-shot work is submitted to.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Allocate `count` primary command buffers from the pool.
    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        unsafe { self.pool.allocate_command_buffers(&self.device, count) }
    }

    /// Allocate and begin a transient command buffer.
    pub fn begin_single_time_commands(&mut self) -> Result<vk::CommandBuffer> {
        let cmd = self
            .allocate(1)?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("No command buffer allocated".to_string()))?;

        if let Err(e) = unsafe {
            begin_command_buffer(&self.device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        } {
            self.free(cmd);
            return Err(e);
        }
        Ok(cmd)
    }

    /// End, submit and wait for a buffer returned by
    /// [`Self::begin_single_time_commands`], then free it.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_single_time_commands(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        let result = unsafe {
            end_command_buffer(&self.device, cmd).and_then(|()| {
                submit_command_buffer(
                    &self.device,
                    self.queue,
                    cmd,
                    &[],
                    &[],
                    &[],
                    vk::Fence::null(),
                )?;
                self.device
                    .queue_wait_idle(self.queue)
                    .call("vkQueueWaitIdle")
            })
        };
        self.free(cmd);
        result
    }

    /// Record `f` into a one-shot buffer and run it to completion.
    pub fn execute<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let cmd = self.begin_single_time_commands()?;
        if let Err(e) = f(self.device.as_ref(), cmd) {
            self.free(cmd);
            return Err(e);
        }
        self.end_single_time_commands(cmd)
    }

    fn free(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.free_command_buffers(self.pool.handle(), &[cmd]);
        }
    }

    /// Copy `size` bytes between two buffers.
    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, size: u64) -> Result<()> {
        self.execute(|device, cmd| {
            let region = vk::BufferCopy::default().size(size);
            unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            Ok(())
        })
    }

    /// Copy tightly packed buffer contents into mip level 0 of the first
    /// `layer_count` layers of an image in `TRANSFER_DST_OPTIMAL` layout.
    ///
    /// Layers follow each other in the buffer with no padding.
    pub fn copy_buffer_to_image(
        &mut self,
        buffer: vk::Buffer,
        image: vk::Image,
        width: u32,
        height: u32,
        layer_count: u32,
    ) -> Result<()> {
        self.execute(|device, cmd| {
            let region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(layer_count),
                )
                .image_offset(vk::Offset3D::default())
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });

            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
            Ok(())
        })
    }

    /// Transition every mip level of the first `layer_count` layers of
    /// `image` between two layouts.
    ///
    /// Fails with [`GpuError::UnsupportedLayoutTransition`] before anything
    /// is submitted if the pair is not in the transition table.
    #[allow(clippy::too_many_arguments)]
    pub fn transition_image_layout(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        mip_levels: u32,
        layer_count: u32,
    ) -> Result<()> {
        crate::transition::layout_transition(old, new)?;
        self.execute(|device, cmd| unsafe {
            record_transition(
                device,
                cmd,
                image,
                aspect_mask(format),
                0,
                mip_levels,
                layer_count,
                old,
                new,
            )
        })
    }

    /// Fill mip levels `1..mip_levels` by successive linear blits and leave
    /// every level in `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// All levels must be in `TRANSFER_DST_OPTIMAL` with level 0 holding the
    /// source data.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn generate_mipmaps(
        &mut self,
        gpu: &GpuContext,
        image: vk::Image,
        format: vk::Format,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Result<()> {
        let features = gpu.format_properties(format).optimal_tiling_features;
        if !supports_linear_blit(features) {
            return Err(GpuError::UnsupportedFormat {
                format,
                feature: "linear-filtered blits",
            });
        }

        self.execute(|device, cmd| unsafe {
            record_mip_chain(device, cmd, image, width, height, mip_levels)
        })
    }

    /// Destroy the command pool and every buffer allocated from it.
    ///
    /// # Safety
    /// No command buffer from this pool may still be executing.
    pub unsafe fn destroy(&self) {
        self.pool.destroy(&self.device);
    }
}

/// Record the blit chain for [`CommandExecutor::generate_mipmaps`].
///
/// # Safety
/// The command buffer must be recording and the image valid.
unsafe fn record_mip_chain(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
) -> Result<()> {
    let color = vk::ImageAspectFlags::COLOR;
    let mut mip_width = width as i32;
    let mut mip_height = height as i32;

    for level in 1..mip_levels {
        record_transition(
            device,
            cmd,
            image,
            color,
            level - 1,
            1,
            1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )?;

        let next_width = (mip_width / 2).max(1);
        let next_height = (mip_height / 2).max(1);

        let blit = vk::ImageBlit::default()
            .src_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: mip_width,
                    y: mip_height,
                    z: 1,
                },
            ])
            .src_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(color)
                    .mip_level(level - 1)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .dst_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: next_width,
                    y: next_height,
                    z: 1,
                },
            ])
            .dst_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(color)
                    .mip_level(level)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        device.cmd_blit_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[blit],
            vk::Filter::LINEAR,
        );

        record_transition(
            device,
            cmd,
            image,
            color,
            level - 1,
            1,
            1,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        mip_width = next_width;
        mip_height = next_height;
    }

    // The last level was only ever a blit destination.
    record_transition(
        device,
        cmd,
        image,
        color,
        mip_levels.saturating_sub(1),
        1,
        1,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_levels_follow_log2_of_largest_side() {
        assert_eq!(mip_level_count(4, 4), 3);
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(512, 512), 10);
        assert_eq!(mip_level_count(1920, 1080), 11);
        assert_eq!(mip_level_count(1, 300), 9);
    }

    #[test]
    fn zero_sized_images_have_one_level() {
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn linear_blit_needs_filter_linear_feature() {
        assert!(supports_linear_blit(
            vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
                | vk::FormatFeatureFlags::BLIT_SRC
        ));
        assert!(!supports_linear_blit(
            vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::BLIT_DST
        ));
    }
}
