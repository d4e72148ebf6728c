//! Surface management for windowed rendering.
//!
//! The windowing layer is only seen through [`PresentationSurface`]: native
//! handles for surface creation plus a framebuffer-size query and a way to
//! block on platform events while the window is minimized.

use crate::context::GpuContext;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Size query of a drawable window.
pub trait DrawableSize {
    /// Current framebuffer size in pixels.
    fn framebuffer_size(&self) -> (u32, u32);

    /// Block until the platform delivers new events.
    ///
    /// Implementations that cannot block on the event queue may sleep
    /// instead. The size is not guaranteed to change while waiting, so
    /// callers give up after [`MAX_DRAWABLE_WAITS`] calls.
    fn wait_events(&self);
}

/// Waits on a zero-sized framebuffer before giving up.
pub const MAX_DRAWABLE_WAITS: u32 = 600;

/// Everything the renderer needs from a window.
pub trait PresentationSurface: DrawableSize + HasDisplayHandle + HasWindowHandle {}

impl<T> PresentationSurface for T where T: DrawableSize + HasDisplayHandle + HasWindowHandle {}

/// Poll until both framebuffer dimensions are non-zero.
///
/// A minimized window reports `(0, 0)`; no chain can be built for it.
/// Fails with [`GpuError::DrawableUnavailable`] if the size is still zero
/// after [`MAX_DRAWABLE_WAITS`] waits.
pub fn wait_for_drawable_size<S>(surface: &S) -> Result<(u32, u32)>
where
    S: DrawableSize + ?Sized,
{
    let mut size = surface.framebuffer_size();
    if size.0 == 0 || size.1 == 0 {
        tracing::debug!("Framebuffer is zero-sized, waiting for events");
    }
    let mut waits = 0;
    while size.0 == 0 || size.1 == 0 {
        if waits == MAX_DRAWABLE_WAITS {
            return Err(GpuError::DrawableUnavailable { waits });
        }
        surface.wait_events();
        waits += 1;
        size = surface.framebuffer_size();
    }
    Ok(size)
}

/// Create a `VkSurfaceKHR` for the window.
///
/// # Safety
/// The instance must have been created with the extensions required by the
/// window's display, and must outlive the surface.
pub unsafe fn create_surface<W>(
    entry: &ash::Entry,
    instance: &ash::Instance,
    window: &W,
) -> Result<vk::SurfaceKHR>
where
    W: HasDisplayHandle + HasWindowHandle + ?Sized,
{
    let display = window
        .display_handle()
        .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
    let window_handle = window
        .window_handle()
        .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

    ash_window::create_surface(
        entry,
        instance,
        display.as_raw(),
        window_handle.as_raw(),
        None,
    )
    .map_err(|e| GpuError::SurfaceCreation(e.to_string()))
}

/// Surface context for windowed rendering.
///
/// Owns the Vulkan surface and the extension loaders used by the
/// presentation chain.
pub struct SurfaceContext {
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    pub fn new(
        surface: vk::SurfaceKHR,
        surface_loader: ash::khr::surface::Instance,
        swapchain_loader: ash::khr::swapchain::Device,
    ) -> Self {
        Self {
            surface,
            surface_loader,
            swapchain_loader,
        }
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Query current surface capabilities for the context's device.
    pub fn capabilities(&self, gpu: &GpuContext) -> Result<SurfaceCapabilities> {
        let physical_device = gpu.physical_device();
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .call("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

            Ok(SurfaceCapabilities {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain created for this surface may still exist.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

/// Surface capabilities query result.
#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    struct MinimizedWindow {
        sizes: RefCell<Vec<(u32, u32)>>,
        waits: Cell<u32>,
    }

    impl DrawableSize for MinimizedWindow {
        fn framebuffer_size(&self) -> (u32, u32) {
            let mut sizes = self.sizes.borrow_mut();
            if sizes.len() > 1 {
                sizes.remove(0)
            } else {
                sizes[0]
            }
        }

        fn wait_events(&self) {
            self.waits.set(self.waits.get() + 1);
        }
    }

    #[test]
    fn polls_until_size_is_nonzero() {
        let window = MinimizedWindow {
            sizes: RefCell::new(vec![(0, 0), (0, 0), (800, 600)]),
            waits: Cell::new(0),
        };
        assert_eq!(wait_for_drawable_size(&window).unwrap(), (800, 600));
        assert_eq!(window.waits.get(), 2);
    }

    #[test]
    fn one_zero_dimension_still_waits() {
        let window = MinimizedWindow {
            sizes: RefCell::new(vec![(1280, 0), (1280, 720)]),
            waits: Cell::new(0),
        };
        assert_eq!(wait_for_drawable_size(&window).unwrap(), (1280, 720));
        assert_eq!(window.waits.get(), 1);
    }

    #[test]
    fn visible_window_returns_immediately() {
        let window = MinimizedWindow {
            sizes: RefCell::new(vec![(1920, 1080)]),
            waits: Cell::new(0),
        };
        assert_eq!(wait_for_drawable_size(&window).unwrap(), (1920, 1080));
        assert_eq!(window.waits.get(), 0);
    }

    #[test]
    fn gives_up_when_size_never_changes() {
        let window = MinimizedWindow {
            sizes: RefCell::new(vec![(0, 0)]),
            waits: Cell::new(0),
        };
        let err = wait_for_drawable_size(&window).unwrap_err();
        assert!(matches!(
            err,
            GpuError::DrawableUnavailable {
                waits: MAX_DRAWABLE_WAITS
            }
        ));
        assert_eq!(window.waits.get(), MAX_DRAWABLE_WAITS);
    }
}
