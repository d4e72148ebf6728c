//! Windowing boundary for the Purrfect engine.
//!
//! Wraps a winit window so the renderer can create a surface from it, query
//! its framebuffer size and wait while it is minimized.

use std::sync::Arc;
use std::time::Duration;

use purrfect_gpu::DrawableSize;
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use thiserror::Error;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Window creation failed: {0}")]
    WindowCreation(String),
    #[error("Event loop error: {0}")]
    EventLoop(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// How long [`PlatformWindow::wait_events`] yields before the size is
/// queried again.
const MINIMIZED_POLL_INTERVAL: Duration = Duration::from_millis(16);

/// Platform configuration.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            title: "Purrfect Engine".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

impl PlatformConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_resizable(mut self, resizable: bool) -> Self {
        self.resizable = resizable;
        self
    }
}

/// A winit window usable as a presentation surface.
#[derive(Clone)]
pub struct PlatformWindow {
    window: Arc<Window>,
}

impl PlatformWindow {
    /// Create a window on a running event loop.
    pub fn create(event_loop: &ActiveEventLoop, config: &PlatformConfig) -> Result<Self> {
        let attributes = Window::default_attributes()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(config.resizable);

        let window = event_loop
            .create_window(attributes)
            .map_err(|e| PlatformError::WindowCreation(e.to_string()))?;

        tracing::info!(
            "Window '{}' created at {}x{}",
            config.title,
            config.width,
            config.height
        );

        Ok(Self {
            window: Arc::new(window),
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    /// Whether the window currently has nothing to draw into.
    pub fn is_minimized(&self) -> bool {
        let (width, height) = self.framebuffer_size();
        width == 0 || height == 0
    }
}

impl DrawableSize for PlatformWindow {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    /// winit delivers events only to the running event loop, so this sleeps
    /// and lets the size be re-queried. Backends that refresh `inner_size`
    /// only on dispatch (Wayland) never change size here; the caller's wait
    /// limit ends the loop. The app runner skips rendering while minimized.
    fn wait_events(&self) {
        std::thread::sleep(MINIMIZED_POLL_INTERVAL);
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> std::result::Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> std::result::Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = PlatformConfig::new("viewer")
            .with_size(800, 600)
            .with_resizable(false);
        assert_eq!(config.title, "viewer");
        assert_eq!((config.width, config.height), (800, 600));
        assert!(!config.resizable);
    }

    #[test]
    fn default_config_is_resizable() {
        assert!(PlatformConfig::default().resizable);
    }
}
