//! Vulkan resource and frame synchronization layer for the Purrfect engine.
//!
//! This crate provides:
//! - Instance, device and queue selection
//! - Presentation chain creation and recreation on resize
//! - Frame pacing with a fixed number of frames in flight
//! - One-shot command submission, layout transitions and mip generation
//! - Buffers, textures and staged uploads via gpu-allocator
//! - Descriptor layouts, pools and sets
//! - Render passes, framebuffers and graphics pipelines

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod mesh;
pub mod pipeline;
pub mod render_pass;
pub mod renderer;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod transition;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::CommandExecutor;
pub use context::{GpuContext, GpuContextBuilder, QueueFamilyIndices};
pub use descriptors::{
    DescriptorLayout, DescriptorLayoutBuilder, DescriptorPool, DescriptorSetId, SetSlot,
};
pub use error::{GpuError, Result};
pub use frame::{FrameBackend, FrameScheduler, FrameStatus, MAX_FRAMES_IN_FLIGHT};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use mesh::{Mesh, MeshVertex, ModelPush};
pub use pipeline::{GraphicsPipeline, GraphicsPipelineBuilder, GraphicsPipelineConfig, ShaderModule};
pub use render_pass::{AttachmentInfo, Framebuffer, RenderPass, RenderPassBuilder};
pub use renderer::{FrameContext, OverlayHandles, Renderer, RendererConfig};
pub use surface::{
    DrawableSize, PresentationSurface, SurfaceCapabilities, SurfaceContext, MAX_DRAWABLE_WAITS,
};
pub use swapchain::{AcquireOutcome, ChainPreferences, ChainState, PresentOutcome, PresentationChain};
pub use texture::{CubemapFaces, GpuTexture, TextureData, TextureDesc, CUBE_FACES};
