//! Viewer application.

use std::path::{Path, PathBuf};

use ash::vk;
use glam::{Mat4, Vec2, Vec3};
use purrfect_app::{AppContext, FrameContext, PurrApp};
use purrfect_gpu::{
    GraphicsPipeline, GraphicsPipelineBuilder, GraphicsPipelineConfig, Mesh, MeshVertex,
    ModelPush, Renderer, SetSlot, ShaderModule,
};
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

const CLEAR_COLOR: [f32; 4] = [0.08, 0.08, 0.12, 1.0];
const SPIN_SPEED: f32 = 0.8;
const DEFAULT_SHADER_DIR: &str = "assets/shaders";

/// Viewer state.
pub struct Viewer {
    quad: Option<Quad>,
    angle: f32,
    paused: bool,
}

/// The quad mesh and the pipeline that draws it.
struct Quad {
    pipeline: GraphicsPipeline,
    mesh: Mesh,
}

impl PurrApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let shader_dir = shader_dir_from_args();
        let quad = if has_quad_shaders(&shader_dir) {
            Some(Quad::new(&mut ctx.renderer, &shader_dir)?)
        } else {
            tracing::warn!(
                "No compiled shaders in {}; clearing only",
                shader_dir.display()
            );
            None
        };

        Ok(Self {
            quad,
            angle: 0.0,
            paused: false,
        })
    }

    fn update(&mut self, _ctx: &AppContext, dt: f32) {
        if !self.paused {
            self.angle = (self.angle + dt * SPIN_SPEED) % std::f32::consts::TAU;
        }
    }

    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()> {
        ctx.renderer.begin_main_pass(CLEAR_COLOR)?;
        if let Some(quad) = &self.quad {
            quad.draw(&mut ctx.renderer, frame, self.model(frame))?;
        }
        ctx.renderer.end_main_pass()?;
        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        tracing::debug!("Viewer sees {width}x{height}");
        Ok(())
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        if let WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(KeyCode::Space),
                    state: ElementState::Pressed,
                    repeat: false,
                    ..
                },
            ..
        } = event
        {
            self.paused = !self.paused;
            return true;
        }
        false
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        if let Some(mut quad) = self.quad.take() {
            if let Err(e) = quad.destroy(&ctx.renderer) {
                tracing::error!("Failed to free quad: {e}");
            }
        }
    }
}

impl Viewer {
    /// Spin around Z, squashed so the quad stays square at any aspect.
    fn model(&self, frame: &FrameContext) -> Mat4 {
        let aspect = frame.aspect_ratio();
        Mat4::from_scale(Vec3::new(1.0 / aspect, 1.0, 1.0))
            * Mat4::from_rotation_z(self.angle)
            * Mat4::from_scale(Vec3::splat(0.6))
    }
}

impl Quad {
    fn new(renderer: &mut Renderer, shader_dir: &Path) -> anyhow::Result<Self> {
        // Registered up front so drawing never allocates.
        renderer.placeholder_texture()?;

        let device = renderer.gpu().device();
        let vertex = unsafe {
            ShaderModule::load(
                device,
                shader_dir.join("quad.vert.spv"),
                vk::ShaderStageFlags::VERTEX,
            )
        }?;
        let fragment = match unsafe {
            ShaderModule::load(
                device,
                shader_dir.join("quad.frag.spv"),
                vk::ShaderStageFlags::FRAGMENT,
            )
        } {
            Ok(fragment) => fragment,
            Err(e) => {
                unsafe { vertex.destroy(device) };
                return Err(e.into());
            }
        };

        let config = GraphicsPipelineConfig::default()
            .with_vertex_input(
                MeshVertex::binding_descriptions(),
                MeshVertex::attribute_descriptions(),
            )
            .with_cull(vk::CullModeFlags::NONE, vk::FrontFace::COUNTER_CLOCKWISE)
            .with_depth(true, true);
        let pipeline = unsafe {
            GraphicsPipelineBuilder::new()
                .shader(vertex)
                .shader(fragment)
                .config(config)
                .set_layout(SetSlot::Global, renderer.texture_layout().handle())
                .push_constant(ModelPush::range())
                .render_pass(renderer.render_pass())
                .build(device)
        }?;

        let (vertices, indices) = quad_geometry();
        let (gpu, executor) = renderer.upload_context();
        let mesh = match Mesh::upload(gpu, executor, &vertices, &indices) {
            Ok(mesh) => mesh,
            Err(e) => {
                unsafe { pipeline.destroy(gpu.device()) };
                return Err(e.into());
            }
        };

        tracing::info!("Quad pipeline ready ({} indices)", mesh.index_count());
        Ok(Self { pipeline, mesh })
    }

    fn draw(&self, renderer: &mut Renderer, frame: &FrameContext, model: Mat4) -> anyhow::Result<()> {
        let descriptor = renderer
            .placeholder_texture()?
            .descriptor()
            .ok_or_else(|| anyhow::anyhow!("placeholder texture has no descriptor set"))?;

        let device = renderer.gpu().device();
        let cmd = frame.command_buffer;
        unsafe { self.pipeline.bind(device, cmd, frame.extent) };
        renderer.descriptor_pool().bind(
            device,
            cmd,
            self.pipeline.layout(),
            SetSlot::Global,
            descriptor,
        )?;
        unsafe { self.mesh.draw(device, cmd, self.pipeline.layout(), model) };
        Ok(())
    }

    fn destroy(&mut self, renderer: &Renderer) -> anyhow::Result<()> {
        unsafe {
            self.pipeline.destroy(renderer.gpu().device());
            self.mesh.destroy(renderer.gpu())?;
        }
        Ok(())
    }
}

fn shader_dir_from_args() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|arg| arg == "--shaders")
        .and_then(|i| args.get(i + 1))
        .map_or_else(|| PathBuf::from(DEFAULT_SHADER_DIR), PathBuf::from)
}

fn has_quad_shaders(dir: &Path) -> bool {
    dir.join("quad.vert.spv").is_file() && dir.join("quad.frag.spv").is_file()
}

/// Unit quad in the XY plane with a colour per corner.
fn quad_geometry() -> (Vec<MeshVertex>, Vec<u32>) {
    let corner = |x: f32, y: f32, color: Vec3, u: f32, v: f32| {
        MeshVertex::new(Vec3::new(x, y, 0.5), color, Vec2::new(u, v), Vec3::Z)
    };
    let vertices = vec![
        corner(-1.0, -1.0, Vec3::new(1.0, 0.3, 0.3), 0.0, 0.0),
        corner(1.0, -1.0, Vec3::new(0.3, 1.0, 0.3), 1.0, 0.0),
        corner(1.0, 1.0, Vec3::new(0.3, 0.3, 1.0), 1.0, 1.0),
        corner(-1.0, 1.0, Vec3::new(1.0, 1.0, 0.3), 0.0, 1.0),
    ];
    (vertices, vec![0, 1, 2, 2, 3, 0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_indices_cover_two_triangles() {
        let (vertices, indices) = quad_geometry();
        assert_eq!(vertices.len(), 4);
        assert_eq!(indices.len(), 6);
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
    }

    #[test]
    fn quad_sits_inside_the_depth_range() {
        let (vertices, _) = quad_geometry();
        assert!(vertices.iter().all(|v| (0.0..=1.0).contains(&v.position.z)));
    }

    #[test]
    fn missing_shader_dir_has_no_quad_shaders() {
        assert!(!has_quad_shaders(Path::new("definitely/not/here")));
    }
}
