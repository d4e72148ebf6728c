//! Shader modules and graphics pipelines.

use crate::descriptors::SetSlot;
use crate::error::{GpuError, Result, VkResultExt};
use crate::render_pass::RenderPass;
use ash::vk;
use std::io::Cursor;
use std::path::Path;

/// Turn a SPIR-V blob into words. Only the length is checked.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| GpuError::ShaderLoad(format!("Invalid SPIR-V blob: {e}")))
}

/// A shader module bound to one pipeline stage.
///
/// Consumed by [`GraphicsPipelineBuilder::build`], which destroys it.
pub struct ShaderModule {
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
}

impl ShaderModule {
    /// Load compiled SPIR-V from `path`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn load(
        device: &ash::Device,
        path: impl AsRef<Path>,
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| GpuError::ShaderLoad(format!("{}: {e}", path.display())))?;
        tracing::debug!("Loaded shader {} ({} bytes)", path.display(), bytes.len());
        Self::from_bytes(device, &bytes, stage)
    }

    /// Create a module from an in-memory SPIR-V blob.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn from_bytes(
        device: &ash::Device,
        bytes: &[u8],
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let code = spirv_words(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = device
            .create_shader_module(&create_info, None)
            .call("vkCreateShaderModule")?;
        Ok(Self { module, stage })
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Destroy a module that never made it into a pipeline.
    ///
    /// # Safety
    /// The device must be the one the module was created on.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_shader_module(self.module, None);
    }
}

/// Fixed-function state of a graphics pipeline.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: false,
            depth_write: false,
            depth_compare_op: vk::CompareOp::LESS,
        }
    }
}

impl GraphicsPipelineConfig {
    pub fn with_vertex_input(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
        self
    }

    pub fn with_cull(mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        self.cull_mode = cull_mode;
        self.front_face = front_face;
        self
    }

    pub fn with_depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self
    }
}

/// Alpha blending applied to every color attachment.
pub fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

struct PassTarget {
    handle: vk::RenderPass,
    color_count: u32,
    samples: vk::SampleCountFlags,
}

/// Assembles a graphics pipeline against one render pass.
#[derive(Default)]
pub struct GraphicsPipelineBuilder {
    shaders: Vec<ShaderModule>,
    config: GraphicsPipelineConfig,
    set_layouts: Vec<Option<vk::DescriptorSetLayout>>,
    push_constants: Vec<vk::PushConstantRange>,
    pass: Option<PassTarget>,
}

impl GraphicsPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shader stage; the module is destroyed when the pipeline is built.
    pub fn shader(mut self, module: ShaderModule) -> Self {
        self.shaders.push(module);
        self
    }

    pub fn config(mut self, config: GraphicsPipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `layout` for descriptor set `slot`.
    pub fn set_layout(mut self, slot: SetSlot, layout: vk::DescriptorSetLayout) -> Self {
        let index = slot.index() as usize;
        if self.set_layouts.len() <= index {
            self.set_layouts.resize(index + 1, None);
        }
        self.set_layouts[index] = Some(layout);
        self
    }

    pub fn push_constant(mut self, range: vk::PushConstantRange) -> Self {
        self.push_constants.push(range);
        self
    }

    /// Attach the render pass; must happen before [`Self::build`].
    pub fn render_pass(mut self, pass: &RenderPass) -> Self {
        self.pass = Some(PassTarget {
            handle: pass.handle(),
            color_count: pass.color_count(),
            samples: pass.samples(),
        });
        self
    }

    /// Descriptor set layouts in set order; slots must be filled from 0
    /// without gaps.
    pub fn ordered_set_layouts(&self) -> Result<Vec<vk::DescriptorSetLayout>> {
        self.set_layouts
            .iter()
            .enumerate()
            .map(|(index, layout)| {
                layout.ok_or_else(|| {
                    GpuError::PipelineCreation(format!("descriptor set {index} has no layout"))
                })
            })
            .collect()
    }

    /// Check everything that does not need the device.
    pub fn validate(&self) -> Result<()> {
        if self.pass.is_none() {
            return Err(GpuError::InvalidState(
                "a render pass must be attached before building a pipeline".to_string(),
            ));
        }
        if self.shaders.is_empty() {
            return Err(GpuError::PipelineCreation("pipeline has no shader stages".to_string()));
        }
        self.ordered_set_layouts().map(|_| ())
    }

    /// Build the pipeline and destroy the shader modules.
    ///
    /// # Safety
    /// The device, render pass and set layouts must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<GraphicsPipeline> {
        let result = self.create(device);
        for shader in self.shaders {
            shader.destroy(device);
        }
        result
    }

    unsafe fn create(&self, device: &ash::Device) -> Result<GraphicsPipeline> {
        self.validate()?;
        let Some(pass) = self.pass.as_ref() else {
            return Err(GpuError::InvalidState("no render pass attached".to_string()));
        };
        let set_layouts = self.ordered_set_layouts()?;
        let config = &self.config;

        let stages: Vec<_> = self
            .shaders
            .iter()
            .map(|shader| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage)
                    .module(shader.module)
                    .name(c"main")
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(pass.samples)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let blend_attachments = vec![alpha_blend_attachment(); pass.color_count as usize];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&self.push_constants);
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .call("vkCreatePipelineLayout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(pass.handle)
            .subpass(0);

        let pipelines = match device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        ) {
            Ok(pipelines) => pipelines,
            Err((_, e)) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        tracing::debug!(
            "Graphics pipeline created: {} stages, {} set layouts",
            stages.len(),
            set_layouts.len()
        );

        Ok(GraphicsPipeline {
            pipeline: pipelines[0],
            layout,
        })
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Bind the pipeline and set a full-extent viewport and scissor.
    ///
    /// # Safety
    /// `cmd` must be recording inside a compatible render pass.
    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);

        let viewport = vk::Viewport::default()
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(
            cmd,
            0,
            &[vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            }],
        );
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn fake_module(stage: vk::ShaderStageFlags) -> ShaderModule {
        ShaderModule {
            module: vk::ShaderModule::from_raw(7),
            stage,
        }
    }

    fn fake_pass() -> PassTarget {
        PassTarget {
            handle: vk::RenderPass::from_raw(3),
            color_count: 1,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    #[test]
    fn spirv_requires_word_alignment() {
        assert!(matches!(
            spirv_words(&[0x03, 0x02, 0x23]),
            Err(GpuError::ShaderLoad(_))
        ));
        let magic = 0x0723_0203_u32.to_le_bytes();
        assert_eq!(spirv_words(&magic).unwrap(), vec![0x0723_0203]);
    }

    #[test]
    fn building_without_render_pass_fails() {
        let builder = GraphicsPipelineBuilder::new()
            .shader(fake_module(vk::ShaderStageFlags::VERTEX))
            .shader(fake_module(vk::ShaderStageFlags::FRAGMENT));
        assert!(matches!(builder.validate(), Err(GpuError::InvalidState(_))));
    }

    #[test]
    fn pipeline_needs_a_shader() {
        let mut builder = GraphicsPipelineBuilder::new();
        builder.pass = Some(fake_pass());
        assert!(matches!(
            builder.validate(),
            Err(GpuError::PipelineCreation(_))
        ));
    }

    #[test]
    fn set_layouts_follow_slot_order() {
        let global = vk::DescriptorSetLayout::from_raw(10);
        let material = vk::DescriptorSetLayout::from_raw(11);
        let builder = GraphicsPipelineBuilder::new()
            .set_layout(SetSlot::Material, material)
            .set_layout(SetSlot::Global, global);
        assert_eq!(builder.ordered_set_layouts().unwrap(), vec![global, material]);
    }

    #[test]
    fn gap_in_set_layouts_is_rejected() {
        let mut builder = GraphicsPipelineBuilder::new()
            .shader(fake_module(vk::ShaderStageFlags::VERTEX))
            .set_layout(SetSlot::Lights, vk::DescriptorSetLayout::from_raw(12));
        builder.pass = Some(fake_pass());
        assert!(matches!(
            builder.validate(),
            Err(GpuError::PipelineCreation(_))
        ));
    }

    #[test]
    fn alpha_blending_is_enabled() {
        let blend = alpha_blend_attachment();
        assert_eq!(blend.blend_enable, vk::TRUE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(
            blend.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
    }

    #[test]
    fn default_config() {
        let config = GraphicsPipelineConfig::default()
            .with_cull(vk::CullModeFlags::NONE, vk::FrontFace::CLOCKWISE)
            .with_depth(true, true);
        assert_eq!(config.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(config.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(config.front_face, vk::FrontFace::CLOCKWISE);
        assert!(config.depth_test && config.depth_write);
    }
}
