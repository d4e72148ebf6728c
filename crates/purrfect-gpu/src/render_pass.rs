//! Render passes and framebuffers.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;

/// Description of one render pass attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    /// Layout used inside the subpass; decides color vs depth role.
    pub layout: vk::ImageLayout,
}

impl Default for AttachmentInfo {
    fn default() -> Self {
        Self {
            format: vk::Format::UNDEFINED,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }
}

impl AttachmentInfo {
    /// Cleared color attachment handed to presentation afterwards.
    pub fn color(format: vk::Format) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    /// Cleared depth attachment whose contents are discarded.
    pub fn depth(format: vk::Format) -> Self {
        Self {
            format,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Self::default()
        }
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_final_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.final_layout = layout;
        self
    }

    pub fn with_load_op(mut self, load_op: vk::AttachmentLoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    fn is_depth(&self) -> bool {
        matches!(
            self.layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                | vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        )
    }

    fn description(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::default()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(self.stencil_load_op)
            .stencil_store_op(self.stencil_store_op)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
    }
}

/// Attachment references of the single subpass.
#[derive(Debug, Clone)]
pub struct SubpassAttachments {
    pub color: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
}

/// Split attachments into color references (declaration order) and at most
/// one depth-stencil reference, by their subpass layout.
pub fn partition_attachments(attachments: &[AttachmentInfo]) -> Result<SubpassAttachments> {
    let mut color = Vec::new();
    let mut depth = None;

    for (index, attachment) in attachments.iter().enumerate() {
        let reference = vk::AttachmentReference {
            attachment: index as u32,
            layout: attachment.layout,
        };
        if attachment.is_depth() {
            if depth.is_some() {
                return Err(GpuError::InvalidState(
                    "Render pass may have only one depth-stencil attachment".to_string(),
                ));
            }
            depth = Some(reference);
        } else {
            color.push(reference);
        }
    }

    Ok(SubpassAttachments { color, depth })
}

/// The external -> subpass 0 dependency guarding attachment writes.
pub fn external_dependency(has_depth: bool) -> vk::SubpassDependency {
    let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    let mut access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    if has_depth {
        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }

    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(access)
}

/// Render pass builder.
#[derive(Default)]
pub struct RenderPassBuilder {
    attachments: Vec<AttachmentInfo>,
}

impl RenderPassBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attachment; its index is its position.
    pub fn attachment(mut self, attachment: AttachmentInfo) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Build a single-subpass render pass.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<RenderPass> {
        let subpass_refs = partition_attachments(&self.attachments)?;
        let descriptions: Vec<vk::AttachmentDescription> =
            self.attachments.iter().map(AttachmentInfo::description).collect();

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&subpass_refs.color);
        if let Some(depth) = subpass_refs.depth.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth);
        }

        let dependency = external_dependency(subpass_refs.depth.is_some());

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&descriptions)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));

        let handle = device
            .create_render_pass(&create_info, None)
            .call("vkCreateRenderPass")?;

        let depth_format = subpass_refs
            .depth
            .map(|r| self.attachments[r.attachment as usize].format);

        tracing::debug!(
            "Render pass created: {} color, depth {:?}",
            subpass_refs.color.len(),
            depth_format
        );

        Ok(RenderPass {
            handle,
            color_count: subpass_refs.color.len() as u32,
            depth_format,
            attachments: self.attachments,
        })
    }
}

/// A single-subpass render pass.
pub struct RenderPass {
    handle: vk::RenderPass,
    color_count: u32,
    depth_format: Option<vk::Format>,
    attachments: Vec<AttachmentInfo>,
}

impl RenderPass {
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// Number of color attachments in the subpass.
    pub fn color_count(&self) -> u32 {
        self.color_count
    }

    /// Format of the depth attachment, if any.
    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth_format
    }

    pub fn attachments(&self) -> &[AttachmentInfo] {
        &self.attachments
    }

    /// Sample count of the first attachment.
    pub fn samples(&self) -> vk::SampleCountFlags {
        self.attachments
            .first()
            .map_or(vk::SampleCountFlags::TYPE_1, |a| a.samples)
    }

    /// Destroy the render pass.
    ///
    /// # Safety
    /// No framebuffer or pipeline created against it may still be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_render_pass(self.handle, None);
    }
}

/// Binds a render pass to concrete image views of one extent.
pub struct Framebuffer {
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl Framebuffer {
    /// Create a framebuffer; `views` follow the pass's attachment order.
    ///
    /// # Safety
    /// The device, render pass and views must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let handle = device
            .create_framebuffer(&create_info, None)
            .call("vkCreateFramebuffer")?;

        Ok(Self { handle, extent })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Destroy the framebuffer.
    ///
    /// # Safety
    /// The framebuffer must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_framebuffer(self.handle, None);
    }
}
