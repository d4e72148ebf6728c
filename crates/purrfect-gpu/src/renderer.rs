//! Top-level renderer owning the GPU context, presentation chain and frame
//! resources.
//!
//! Everything sized after the chain (framebuffers, the depth target) lives in
//! [`ChainTargets`] and is destroyed and rebuilt together with the chain.

use crate::command::{begin_command_buffer, end_command_buffer, submit_command_buffer, CommandExecutor};
use crate::context::{GpuContext, GpuContextBuilder};
use crate::descriptors::{material_layout, texture_layout, DescriptorLayout, DescriptorPool};
use crate::error::{GpuError, Result};
use crate::frame::{FrameBackend, FrameScheduler, FrameStatus, MAX_FRAMES_IN_FLIGHT};
use crate::render_pass::{AttachmentInfo, Framebuffer, RenderPass, RenderPassBuilder};
use crate::surface::{wait_for_drawable_size, DrawableSize, PresentationSurface, SurfaceContext};
use crate::swapchain::{AcquireOutcome, ChainPreferences, PresentOutcome, PresentationChain};
use crate::sync::FrameSlots;
use crate::texture::{GpuTexture, TextureData, TextureDesc};
use ash::vk;

/// Renderer configuration.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub chain: ChainPreferences,
    /// Give the main render pass a depth attachment.
    pub depth: bool,
    /// Maximum sets in the shared descriptor pool.
    pub descriptor_sets: u32,
    /// Descriptor counts of the shared pool.
    pub descriptor_sizes: Vec<(vk::DescriptorType, u32)>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            chain: ChainPreferences::default(),
            depth: true,
            descriptor_sets: 256,
            descriptor_sizes: vec![
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1024),
                (vk::DescriptorType::UNIFORM_BUFFER, 256),
                (vk::DescriptorType::STORAGE_BUFFER, 64),
            ],
        }
    }
}

impl RendererConfig {
    pub fn with_chain(mut self, chain: ChainPreferences) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_depth(mut self, depth: bool) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_descriptor_pool(
        mut self,
        max_sets: u32,
        sizes: Vec<(vk::DescriptorType, u32)>,
    ) -> Self {
        self.descriptor_sets = max_sets;
        self.descriptor_sizes = sizes;
        self
    }
}

/// Handles a UI overlay renderer needs to initialise itself.
#[derive(Debug, Clone, Copy)]
pub struct OverlayHandles {
    pub instance: vk::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: vk::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,
    pub descriptor_pool: vk::DescriptorPool,
    pub render_pass: vk::RenderPass,
    pub min_image_count: u32,
    pub image_count: u32,
}

/// State of the frame being recorded.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub command_buffer: vk::CommandBuffer,
    pub image_index: u32,
    /// Frame slot in `0..MAX_FRAMES_IN_FLIGHT`.
    pub slot: usize,
    pub frame_number: u64,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
}

/// Framebuffers and depth target matching one chain.
struct ChainTargets {
    framebuffers: Vec<Framebuffer>,
    depth: Option<GpuTexture>,
}

impl ChainTargets {
    fn build(
        gpu: &GpuContext,
        executor: &mut CommandExecutor,
        chain: &PresentationChain,
        render_pass: &RenderPass,
    ) -> Result<Self> {
        let extent = chain.extent();
        let mut targets = Self {
            framebuffers: Vec::with_capacity(chain.image_count()),
            depth: None,
        };

        if let Some(format) = render_pass.depth_format() {
            let desc = TextureDesc::depth_target(extent.width, extent.height, format)
                .named("chain depth");
            targets.depth = Some(GpuTexture::new(gpu, executor, &desc, TextureData::Empty)?);
        }

        for &view in chain.views() {
            let mut attachments = vec![view];
            if let Some(depth) = &targets.depth {
                attachments.push(depth.view());
            }
            let framebuffer =
                unsafe { Framebuffer::new(gpu.device(), render_pass.handle(), &attachments, extent) };
            match framebuffer {
                Ok(framebuffer) => targets.framebuffers.push(framebuffer),
                Err(e) => {
                    unsafe { targets.destroy(gpu)? };
                    return Err(e);
                }
            }
        }

        Ok(targets)
    }

    unsafe fn destroy(&mut self, gpu: &GpuContext) -> Result<()> {
        for framebuffer in self.framebuffers.drain(..) {
            framebuffer.destroy(gpu.device());
        }
        if let Some(mut depth) = self.depth.take() {
            depth.destroy(gpu)?;
        }
        Ok(())
    }
}

/// Drives the real device on behalf of the [`FrameScheduler`].
struct Presenter<'a, W: ?Sized> {
    gpu: &'a GpuContext,
    surface: &'a SurfaceContext,
    chain: &'a mut PresentationChain,
    executor: &'a mut CommandExecutor,
    slots: &'a FrameSlots,
    render_pass: &'a RenderPass,
    targets: &'a mut ChainTargets,
    window: &'a W,
}

impl<W: DrawableSize + ?Sized> FrameBackend for Presenter<'_, W> {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        unsafe { self.slots.get(slot)?.wait(self.gpu.device()) }
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        unsafe { self.slots.get(slot)?.reset(self.gpu.device()) }
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.slots.get(slot)?.image_available;
        self.chain.acquire_next_image(semaphore)
    }

    fn submit(&mut self, slot: usize, cmd: vk::CommandBuffer) -> Result<()> {
        let frame = self.slots.get(slot)?;
        unsafe {
            submit_command_buffer(
                self.gpu.device(),
                self.gpu.graphics_queue(),
                cmd,
                &[frame.image_available],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[frame.render_finished],
                frame.in_flight,
            )
        }
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let render_finished = self.slots.get(slot)?.render_finished;
        self.chain
            .present(self.gpu.present_queue(), image_index, &[render_finished])
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.gpu.wait_idle()
    }

    fn recreate_chain(&mut self) -> Result<()> {
        let (width, height) = wait_for_drawable_size(self.window)?;
        self.gpu.wait_idle()?;

        unsafe { self.targets.destroy(self.gpu)? };
        self.chain
            .recreate(self.gpu, self.surface, self.executor, width, height)?;
        check_pass_format(self.render_pass, self.chain.format())?;
        *self.targets = ChainTargets::build(self.gpu, self.executor, self.chain, self.render_pass)?;

        tracing::info!(
            "Presentation chain rebuilt at {}x{} (generation {})",
            self.chain.extent().width,
            self.chain.extent().height,
            self.chain.generation()
        );
        Ok(())
    }
}

fn check_pass_format(render_pass: &RenderPass, format: vk::Format) -> Result<()> {
    match render_pass.attachments().first() {
        Some(color) if color.format == format => Ok(()),
        _ => Err(GpuError::InvalidState(format!(
            "chain format changed to {format:?}; the main render pass no longer matches"
        ))),
    }
}

fn main_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
) -> Result<RenderPass> {
    let mut builder = RenderPassBuilder::new().attachment(AttachmentInfo::color(color_format));
    if let Some(format) = depth_format {
        builder = builder.attachment(AttachmentInfo::depth(format));
    }
    unsafe { builder.build(device) }
}

/// Owns the whole rendering stack for one window.
pub struct Renderer {
    gpu: GpuContext,
    surface: SurfaceContext,
    chain: PresentationChain,
    executor: CommandExecutor,
    slots: FrameSlots,
    scheduler: FrameScheduler,
    descriptor_pool: DescriptorPool,
    texture_layout: DescriptorLayout,
    material_layout: DescriptorLayout,
    placeholder: Option<GpuTexture>,
    render_pass: RenderPass,
    targets: ChainTargets,
}

impl Renderer {
    /// Create the GPU context for `window` and build the first chain.
    ///
    /// Blocks while the window has a zero-sized framebuffer, up to
    /// [`crate::surface::MAX_DRAWABLE_WAITS`] waits.
    pub fn new<W>(window: &W, context: GpuContextBuilder, config: RendererConfig) -> Result<Self>
    where
        W: PresentationSurface + ?Sized,
    {
        let (width, height) = wait_for_drawable_size(window)?;
        let (gpu, surface) = context.build_for_surface(window)?;
        let mut executor = CommandExecutor::new(&gpu)?;

        let mut chain = PresentationChain::new(&gpu, &surface, config.chain);
        chain.configure(&gpu, &surface, width, height)?;
        chain.initialize(&gpu, &surface, &mut executor)?;

        let device = gpu.device();
        let slots = unsafe { FrameSlots::new(device, &executor, MAX_FRAMES_IN_FLIGHT) }?;
        let descriptor_pool =
            unsafe { DescriptorPool::new(device, config.descriptor_sets, &config.descriptor_sizes) }?;
        let texture_layout = unsafe { texture_layout().build(device) }?;
        let material_layout = unsafe { material_layout().build(device) }?;

        let depth_format = if config.depth {
            Some(gpu.depth_format()?)
        } else {
            None
        };
        let render_pass = main_render_pass(device, chain.format(), depth_format)?;
        let targets = ChainTargets::build(&gpu, &mut executor, &chain, &render_pass)?;

        tracing::info!(
            "Renderer ready: {} frames in flight, {} chain images",
            MAX_FRAMES_IN_FLIGHT,
            chain.image_count()
        );

        Ok(Self {
            gpu,
            surface,
            chain,
            executor,
            slots,
            scheduler: FrameScheduler::new(),
            descriptor_pool,
            texture_layout,
            material_layout,
            placeholder: None,
            render_pass,
            targets,
        })
    }

    /// Wait for the frame slot, acquire an image and begin recording.
    ///
    /// On [`FrameStatus::Skipped`] nothing is recording and `end_frame` must
    /// not be called.
    pub fn begin_frame<W>(&mut self, window: &W) -> Result<FrameStatus>
    where
        W: DrawableSize + ?Sized,
    {
        let mut presenter = Presenter {
            gpu: &self.gpu,
            surface: &self.surface,
            chain: &mut self.chain,
            executor: &mut self.executor,
            slots: &self.slots,
            render_pass: &self.render_pass,
            targets: &mut self.targets,
            window,
        };
        let status = self.scheduler.begin_frame(&mut presenter)?;

        if status != FrameStatus::Skipped {
            let cmd = self.slots.get(self.scheduler.slot())?.command_buffer;
            unsafe {
                begin_command_buffer(
                    self.gpu.device(),
                    cmd,
                    vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                )
            }?;
        }
        Ok(status)
    }

    /// Finish recording, submit, present and wait for the device to idle.
    pub fn end_frame<W>(&mut self, window: &W) -> Result<FrameStatus>
    where
        W: DrawableSize + ?Sized,
    {
        if !self.scheduler.in_frame() {
            return Err(GpuError::InvalidState("no frame in progress".to_string()));
        }
        let cmd = self.slots.get(self.scheduler.slot())?.command_buffer;
        unsafe { end_command_buffer(self.gpu.device(), cmd) }?;

        let mut presenter = Presenter {
            gpu: &self.gpu,
            surface: &self.surface,
            chain: &mut self.chain,
            executor: &mut self.executor,
            slots: &self.slots,
            render_pass: &self.render_pass,
            targets: &mut self.targets,
            window,
        };
        self.scheduler.end_frame(&mut presenter, cmd)
    }

    /// The frame being recorded, if any.
    pub fn frame(&self) -> Option<FrameContext> {
        let image_index = self.scheduler.image_index()?;
        let slot = self.scheduler.slot();
        Some(FrameContext {
            command_buffer: self.slots.get(slot).ok()?.command_buffer,
            image_index,
            slot,
            frame_number: self.scheduler.frame_count(),
            extent: self.chain.extent(),
            render_pass: self.render_pass.handle(),
            framebuffer: self.targets.framebuffers.get(image_index as usize)?.handle(),
        })
    }

    /// Begin the main render pass on the current frame's framebuffer.
    pub fn begin_main_pass(&self, clear_color: [f32; 4]) -> Result<()> {
        let frame = self
            .frame()
            .ok_or_else(|| GpuError::InvalidState("no frame in progress".to_string()))?;

        let mut clear_values = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }];
        if self.render_pass.depth_format().is_some() {
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        }

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(frame.render_pass)
            .framebuffer(frame.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: frame.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.gpu.device().cmd_begin_render_pass(
                frame.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
        Ok(())
    }

    /// End the main render pass.
    pub fn end_main_pass(&self) -> Result<()> {
        let frame = self
            .frame()
            .ok_or_else(|| GpuError::InvalidState("no frame in progress".to_string()))?;
        unsafe { self.gpu.device().cmd_end_render_pass(frame.command_buffer) };
        Ok(())
    }

    /// Rebuild the chain at the next `begin_frame` or `end_frame`.
    pub fn request_recreate(&mut self) {
        self.scheduler.request_resize();
    }

    /// White 1x1 texture registered against the texture layout, created on
    /// first use.
    pub fn placeholder_texture(&mut self) -> Result<&GpuTexture> {
        if self.placeholder.is_none() {
            let mut texture = GpuTexture::placeholder(&self.gpu, &mut self.executor)?;
            texture.register_descriptor(
                self.gpu.device(),
                &mut self.descriptor_pool,
                &self.texture_layout,
            )?;
            self.placeholder = Some(texture);
        }
        self.placeholder
            .as_ref()
            .ok_or_else(|| GpuError::Other("placeholder texture missing".to_string()))
    }

    /// Upload a texture and register it against the texture layout.
    pub fn create_texture(&mut self, desc: &TextureDesc, data: TextureData<'_>) -> Result<GpuTexture> {
        let mut texture = GpuTexture::new(&self.gpu, &mut self.executor, desc, data)?;
        if texture.sampler().is_some() {
            if let Err(e) = texture.register_descriptor(
                self.gpu.device(),
                &mut self.descriptor_pool,
                &self.texture_layout,
            ) {
                unsafe { texture.destroy(&self.gpu)? };
                return Err(e);
            }
        }
        Ok(texture)
    }

    pub fn overlay_handles(&self) -> OverlayHandles {
        let min_image_count = self
            .surface
            .capabilities(&self.gpu)
            .map_or(2, |caps| caps.capabilities.min_image_count);
        OverlayHandles {
            instance: self.gpu.instance().handle(),
            physical_device: self.gpu.physical_device(),
            device: self.gpu.device().handle(),
            queue_family: self.gpu.graphics_queue_family(),
            queue: self.gpu.graphics_queue(),
            descriptor_pool: self.descriptor_pool.handle(),
            render_pass: self.render_pass.handle(),
            min_image_count,
            image_count: self.chain.image_count() as u32,
        }
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn executor_mut(&mut self) -> &mut CommandExecutor {
        &mut self.executor
    }

    /// Context and executor together, for uploads.
    pub fn upload_context(&mut self) -> (&GpuContext, &mut CommandExecutor) {
        (&self.gpu, &mut self.executor)
    }

    pub fn chain(&self) -> &PresentationChain {
        &self.chain
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.descriptor_pool
    }

    pub fn descriptor_pool_mut(&mut self) -> &mut DescriptorPool {
        &mut self.descriptor_pool
    }

    pub fn texture_layout(&self) -> &DescriptorLayout {
        &self.texture_layout
    }

    pub fn material_layout(&self) -> &DescriptorLayout {
        &self.material_layout
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.render_pass.depth_format()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.chain.extent()
    }

    pub fn frame_count(&self) -> u64 {
        self.scheduler.frame_count()
    }

    /// Number of chain rebuilds since creation.
    pub fn recreations(&self) -> u64 {
        self.scheduler.recreations()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            tracing::error!("Failed to wait idle during renderer shutdown: {e}");
        }

        unsafe {
            let device = self.gpu.device();
            if let Err(e) = self.targets.destroy(&self.gpu) {
                tracing::error!("Failed to free chain targets: {e}");
            }
            if let Some(mut placeholder) = self.placeholder.take() {
                if let Err(e) = placeholder.destroy(&self.gpu) {
                    tracing::error!("Failed to free placeholder texture: {e}");
                }
            }
            self.render_pass.destroy(device);
            self.descriptor_pool.destroy(device);
            self.material_layout.destroy(device);
            self.texture_layout.destroy(device);
            self.slots.destroy(device);
            self.executor.destroy();
            self.chain.destroy();
            self.surface.destroy();
        }
        tracing::debug!("Renderer destroyed");
    }
}
