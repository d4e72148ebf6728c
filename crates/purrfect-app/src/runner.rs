//! Application runner and event loop.

use std::thread;
use std::time::{Duration, Instant};

use purrfect_gpu::{ChainPreferences, FrameStatus, GpuContextBuilder, Renderer, RendererConfig};
use purrfect_platform::{PlatformConfig, PlatformError, PlatformWindow};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use crate::app::PurrApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Present with FIFO only.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Give the main render pass a depth attachment.
    pub depth: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Purrfect Engine".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            depth: true,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_depth(mut self, depth: bool) -> Self {
        self.depth = depth;
        self
    }

    fn platform(&self) -> PlatformConfig {
        PlatformConfig::new(self.title.clone()).with_size(self.width, self.height)
    }

    fn renderer(&self) -> RendererConfig {
        let chain = if self.vsync {
            ChainPreferences::vsync()
        } else {
            ChainPreferences::default()
        };
        RendererConfig::default()
            .with_chain(chain)
            .with_depth(self.depth)
    }

    fn frame_budget(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run a [`PurrApp`] with the given configuration.
///
/// Initializes logging, creates the window and renderer, and runs the event
/// loop until the window closes. An unrecoverable error during
/// initialization or rendering is logged and the process exits with code 1
/// after the application and renderer have been torn down.
pub fn run_app<A: PurrApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new().map_err(|e| PlatformError::EventLoop(e.to_string()))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        fatal: None,
    };

    event_loop
        .run_app(&mut runner)
        .map_err(|e| PlatformError::EventLoop(e.to_string()))?;

    if let Some(e) = runner.fatal.take() {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

struct AppRunner<A: PurrApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    fatal: Option<anyhow::Error>,
}

struct AppState<A: PurrApp> {
    // Fields drop in order: the app goes before the renderer it draws with.
    app: A,
    ctx: AppContext,
    frame_budget: Option<Duration>,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: PurrApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");
        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => self.fail(event_loop, e.context("failed to initialize application")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame() {
                    Ok(()) => state.ctx.window.request_redraw(),
                    Err(e) => self.fail(event_loop, e),
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    tracing::debug!("Window resized to {}x{}", size.width, size.height);
                    state.ctx.renderer.request_recreate();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: PurrApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window = PlatformWindow::create(event_loop, &self.config.platform())?;

        let context = GpuContextBuilder::new()
            .app_name(self.config.title.clone())
            .validation(self.config.validation);
        let renderer = Renderer::new(&window, context, self.config.renderer())?;
        info!("GPU: {}", renderer.gpu().capabilities().summary());

        let mut ctx = AppContext::new(window, renderer);
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            app,
            ctx,
            frame_budget: self.config.frame_budget(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }

    /// Tear everything down and stop the loop; `run_app` exits with code 1.
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        self.fatal = Some(e);
        event_loop.exit();
    }
}

impl<A: PurrApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        // Nothing to present into while minimized.
        if self.ctx.window.is_minimized() {
            return Ok(());
        }

        let frame_start = Instant::now();
        let dt = self.ctx.tick();
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&self.ctx, dt);

        let status = self.ctx.renderer.begin_frame(&self.ctx.window)?;
        self.notify_chain_change(status)?;
        if status == FrameStatus::Skipped {
            return Ok(());
        }

        let frame = self
            .ctx
            .renderer
            .frame()
            .ok_or_else(|| anyhow::anyhow!("renderer began a frame without an image"))?;
        self.app.render(&mut self.ctx, &FrameContext::new(&frame, dt))?;

        let status = self.ctx.renderer.end_frame(&self.ctx.window)?;
        self.notify_chain_change(status)?;

        if let Some(budget) = self.frame_budget {
            let elapsed = frame_start.elapsed();
            if elapsed < budget {
                thread::sleep(budget - elapsed);
            }
        }

        Ok(())
    }

    fn notify_chain_change(&mut self, status: FrameStatus) -> anyhow::Result<()> {
        if status.chain_changed() {
            let extent = self.ctx.extent();
            self.app.on_resize(&mut self.ctx, extent.width, extent.height)?;
            info!("Resized to {}x{}", extent.width, extent.height);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        let frames = self.ctx.frame_count();
        if frames > 0 {
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", self.fps_sum / frames as f64);
            info!("  Total frames: {frames}");
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.renderer.gpu().wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn vsync_selects_fifo_only() {
        let renderer = AppConfig::default().with_vsync(true).renderer();
        assert_eq!(renderer.chain.present_modes, vec![vk::PresentModeKHR::FIFO]);
    }

    #[test]
    fn default_prefers_low_latency_modes() {
        let renderer = AppConfig::default().renderer();
        assert_eq!(
            renderer.chain.present_modes,
            vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        );
        assert!(renderer.depth);
    }

    #[test]
    fn frame_budget_from_target_fps() {
        assert_eq!(AppConfig::default().frame_budget(), None);
        assert_eq!(
            AppConfig::default().with_target_fps(50).frame_budget(),
            Some(Duration::from_millis(20))
        );
        assert_eq!(AppConfig::default().with_target_fps(0).frame_budget(), None);
    }

    #[test]
    fn platform_config_carries_title_and_size() {
        let platform = AppConfig::new("viewer").with_size(640, 480).platform();
        assert_eq!(platform.title, "viewer");
        assert_eq!((platform.width, platform.height), (640, 480));
    }
}
