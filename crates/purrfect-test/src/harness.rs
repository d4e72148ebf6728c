//! Headless GPU context for hardware-gated tests.

use ash::vk;
use image::{ImageBuffer, Rgba, RgbaImage};
use parking_lot::{Mutex, MutexGuard};
use purrfect_gpu::{CommandExecutor, GpuBuffer, GpuContext, GpuContextBuilder, GpuTexture};

use crate::{Result, TestError};

/// Only one GPU context may exist per process; tests take turns.
static GPU_LOCK: Mutex<()> = Mutex::new(());

/// A presentation-less GPU context plus a one-shot command executor.
pub struct HeadlessGpu {
    executor: CommandExecutor,
    // Released after the context is gone.
    gpu: GpuContext,
    _guard: MutexGuard<'static, ()>,
}

impl HeadlessGpu {
    /// Create a context with validation enabled.
    ///
    /// Blocks until no other test holds a context.
    pub fn new() -> Result<Self> {
        let guard = GPU_LOCK.lock();
        let gpu = GpuContextBuilder::new()
            .app_name("purrfect-test")
            .validation(true)
            .build()?;
        let executor = CommandExecutor::new(&gpu)?;
        tracing::info!("Headless GPU: {}", gpu.capabilities().summary());

        Ok(Self {
            executor,
            gpu,
            _guard: guard,
        })
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn executor(&mut self) -> &mut CommandExecutor {
        &mut self.executor
    }

    /// Context and executor together, for uploads.
    pub fn split(&mut self) -> (&GpuContext, &mut CommandExecutor) {
        (&self.gpu, &mut self.executor)
    }

    /// Host-visible, coherent buffer.
    pub fn host_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        Ok(self.gpu().create_buffer(
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            name,
        )?)
    }

    /// Copy a device buffer into host memory and return its bytes.
    pub fn download(&mut self, buffer: &GpuBuffer) -> Result<Vec<u8>> {
        let mut readback =
            self.host_buffer(buffer.size, vk::BufferUsageFlags::TRANSFER_DST, "readback")?;
        let copied = readback
            .copy_from(&mut self.executor, buffer)
            .and_then(|()| readback.map().map(|mapping| mapping.read().to_vec()));
        self.gpu().free_buffer(&mut readback)?;
        Ok(copied?)
    }

    /// Read one mip level of an RGBA8 texture in `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// The texture is returned to its original layout afterwards.
    pub fn read_texture(&mut self, texture: &GpuTexture, level: u32) -> Result<RgbaImage> {
        self.read_texture_layer(texture, level, 0)
    }

    /// Read one mip level of one array layer, such as a cube face.
    pub fn read_texture_layer(
        &mut self,
        texture: &GpuTexture,
        level: u32,
        layer: u32,
    ) -> Result<RgbaImage> {
        if level >= texture.mip_levels() {
            return Err(TestError::Readback(format!(
                "level {level} out of {} mips",
                texture.mip_levels()
            )));
        }
        if layer >= texture.layers() {
            return Err(TestError::Readback(format!(
                "layer {layer} out of {}",
                texture.layers()
            )));
        }
        let extent = texture.extent();
        let width = (extent.width >> level).max(1);
        let height = (extent.height >> level).max(1);
        let size = u64::from(width) * u64::from(height) * 4;

        let mut readback =
            self.host_buffer(size, vk::BufferUsageFlags::TRANSFER_DST, "texture readback")?;
        let image = texture.image();
        let layout = texture.layout();
        let buffer = readback.handle();

        let recorded = self.executor.execute(|device, cmd| {
            unsafe {
                readback_barrier(device, cmd, image, level, layer, layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                let region = vk::BufferImageCopy::default()
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(level)
                            .base_array_layer(layer)
                            .layer_count(1),
                    )
                    .image_extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    });
                device.cmd_copy_image_to_buffer(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    buffer,
                    &[region],
                );
                readback_barrier(device, cmd, image, level, layer, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, layout);
            }
            Ok(())
        });
        let pixels = recorded.and_then(|()| readback.map().map(|mapping| mapping.read().to_vec()));
        self.gpu().free_buffer(&mut readback)?;

        ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, pixels?)
            .ok_or_else(|| TestError::Readback("pixel count does not match extent".to_string()))
    }
}

impl Drop for HeadlessGpu {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait idle: {e}");
        }
        unsafe { self.executor.destroy() };
    }
}

/// Tightly packed RGBA8 texels of one colour.
pub fn solid_rgba(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    color.repeat((width * height) as usize)
}

unsafe fn readback_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    level: u32,
    layer: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(level)
                .level_count(1)
                .base_array_layer(layer)
                .layer_count(1),
        )
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ);

    device.cmd_pipeline_barrier(
        cmd,
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solid_rgba_repeats_the_colour() {
        let texels = solid_rgba(2, 3, [1, 2, 3, 4]);
        assert_eq!(texels.len(), 24);
        assert!(texels.chunks(4).all(|t| t == [1, 2, 3, 4]));
    }
}
