//! Application context.

use std::time::Instant;

use ash::vk;
use purrfect_gpu::Renderer;
use purrfect_platform::PlatformWindow;

/// State shared with every [`crate::PurrApp`] callback.
pub struct AppContext {
    pub window: PlatformWindow,
    pub renderer: Renderer,
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    pub(crate) fn new(window: PlatformWindow, renderer: Renderer) -> Self {
        Self {
            window,
            renderer,
            last_frame_time: Instant::now(),
        }
    }

    /// Current presentation chain extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.renderer.extent()
    }

    pub fn width(&self) -> u32 {
        self.extent().width
    }

    pub fn height(&self) -> u32 {
        self.extent().height
    }

    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Total frames presented.
    pub fn frame_count(&self) -> u64 {
        self.renderer.frame_count()
    }

    /// Seconds since the previous frame, restarting the clock.
    pub(crate) fn tick(&mut self) -> f32 {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        dt
    }
}
