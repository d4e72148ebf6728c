//! Presentation chain (swapchain) management.
//!
//! A chain moves through `Unconfigured -> Configured -> Active`. Acquire or
//! present results that report the surface as out of date mark it `Stale`;
//! [`PresentationChain::recreate`] tears the whole chain down and builds a
//! new one. Chains are never resized in place.

use crate::command::CommandExecutor;
use crate::context::GpuContext;
use crate::error::{GpuError, Result, VkResultExt};
use crate::surface::{SurfaceCapabilities, SurfaceContext};
use crate::transition::{layout_transition, record_transition};
use ash::vk;
use std::sync::Arc;

/// Lifecycle state of a [`PresentationChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Unconfigured,
    Configured,
    Active,
    Stale,
    Destroyed,
}

/// Caller preferences for chain configuration.
#[derive(Debug, Clone)]
pub struct ChainPreferences {
    pub formats: Vec<vk::Format>,
    pub color_space: vk::ColorSpaceKHR,
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Layout every chain image is put in right after creation.
    pub target_layout: vk::ImageLayout,
}

impl Default for ChainPreferences {
    fn default() -> Self {
        Self {
            formats: vec![vk::Format::B8G8R8A8_UNORM],
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            present_modes: vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE],
            target_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

impl ChainPreferences {
    /// Present with FIFO only.
    pub fn vsync() -> Self {
        Self {
            present_modes: vec![vk::PresentModeKHR::FIFO],
            ..Self::default()
        }
    }
}

/// Format, present mode and extent chosen for one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

impl ChainConfig {
    /// Choose a configuration from the surface's current capabilities.
    pub fn select(
        caps: &SurfaceCapabilities,
        preferences: &ChainPreferences,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let surface_format =
            choose_surface_format(&caps.formats, &preferences.formats, preferences.color_space)
                .ok_or_else(|| {
                    GpuError::SwapchainCreation("Surface reports no formats".to_string())
                })?;
        let present_mode = choose_present_mode(&caps.present_modes, &preferences.present_modes);
        let extent = calculate_extent(&caps.capabilities, width, height);

        Ok(Self {
            surface_format,
            present_mode,
            extent,
        })
    }
}

/// Result of acquiring a chain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// No image was acquired; the chain must be rebuilt.
    OutOfDate,
}

/// Result of presenting a chain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Out of date or suboptimal; the chain should be rebuilt.
    Stale,
}

/// The presentable image chain of one surface.
pub struct PresentationChain {
    device: Arc<ash::Device>,
    loader: ash::khr::swapchain::Device,
    preferences: ChainPreferences,
    config: Option<ChainConfig>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    state: ChainState,
    generation: u64,
}

impl PresentationChain {
    /// Create an unconfigured chain for `surface`.
    pub fn new(gpu: &GpuContext, surface: &SurfaceContext, preferences: ChainPreferences) -> Self {
        Self {
            device: gpu.device_arc(),
            loader: surface.swapchain_loader().clone(),
            preferences,
            config: None,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            state: ChainState::Unconfigured,
            generation: 0,
        }
    }

    /// Choose format, present mode and extent for a `width`x`height`
    /// framebuffer.
    pub fn configure(
        &mut self,
        gpu: &GpuContext,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
    ) -> Result<ChainConfig> {
        if self.state != ChainState::Unconfigured {
            return Err(GpuError::InvalidState(format!(
                "cannot configure a chain in state {:?}",
                self.state
            )));
        }

        let caps = surface.capabilities(gpu)?;
        let config = ChainConfig::select(&caps, &self.preferences, width, height)?;

        if !self.preferences.formats.contains(&config.surface_format.format) {
            tracing::warn!(
                "No preferred surface format available, falling back to {:?}",
                config.surface_format.format
            );
        }
        if !self.preferences.present_modes.contains(&config.present_mode) {
            tracing::warn!(
                "No preferred present mode available, falling back to {:?}",
                config.present_mode
            );
        }

        self.config = Some(config);
        self.state = ChainState::Configured;
        Ok(config)
    }

    /// Create the swapchain, put every image in the target layout and build
    /// one view per image.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn initialize(
        &mut self,
        gpu: &GpuContext,
        surface: &SurfaceContext,
        executor: &mut CommandExecutor,
    ) -> Result<()> {
        let config = match (self.state, self.config) {
            (ChainState::Configured, Some(config)) => config,
            (state, _) => {
                return Err(GpuError::InvalidState(format!(
                    "cannot initialize a chain in state {state:?}"
                )))
            }
        };
        let target_layout = self.preferences.target_layout;
        layout_transition(vk::ImageLayout::UNDEFINED, target_layout)?;

        let caps = surface.capabilities(gpu)?;
        let min_image_count = image_count(&caps.capabilities);

        let families = gpu.queue_families();
        let family_indices = [families.graphics, families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(min_image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());
        create_info = if families.is_split() {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;
        self.swapchain = swapchain;

        self.images = unsafe { self.loader.get_swapchain_images(swapchain) }
            .call("vkGetSwapchainImagesKHR")?;

        let images = self.images.clone();
        executor.execute(|device, cmd| {
            for &image in &images {
                unsafe {
                    record_transition(
                        device,
                        cmd,
                        image,
                        vk::ImageAspectFlags::COLOR,
                        0,
                        1,
                        1,
                        vk::ImageLayout::UNDEFINED,
                        target_layout,
                    )?;
                }
            }
            Ok(())
        })?;

        for &image in &images {
            let view = unsafe { create_view(&self.device, image, config.surface_format.format) }?;
            self.views.push(view);
        }

        self.state = ChainState::Active;
        self.generation += 1;

        tracing::info!(
            "Presentation chain created: {}x{}, {:?}, {:?}, {} images",
            config.extent.width,
            config.extent.height,
            config.surface_format.format,
            config.present_mode,
            self.images.len()
        );

        Ok(())
    }

    /// Acquire the next presentable image, signaling `semaphore` when it is
    /// ready.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire_next_image(&mut self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        self.require_active("acquire")?;

        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.state = ChainState::Stale;
                Ok(AcquireOutcome::OutOfDate)
            }
            Err(result) => Err(GpuError::Call {
                call: "vkAcquireNextImageKHR",
                result,
            }),
        }
    }

    /// Queue `image_index` for presentation once `wait_semaphores` signal.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        self.require_active("present")?;

        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.state = ChainState::Stale;
                Ok(PresentOutcome::Stale)
            }
            Err(result) => Err(GpuError::Call {
                call: "vkQueuePresentKHR",
                result,
            }),
        }
    }

    /// Destroy the current chain and build a new one for a
    /// `width`x`height` framebuffer.
    ///
    /// The device must be idle; nothing may still reference the old images.
    pub fn recreate(
        &mut self,
        gpu: &GpuContext,
        surface: &SurfaceContext,
        executor: &mut CommandExecutor,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if self.state == ChainState::Destroyed {
            return Err(GpuError::InvalidState(
                "cannot recreate a destroyed chain".to_string(),
            ));
        }

        unsafe { self.destroy_resources() };
        self.config = None;
        self.state = ChainState::Unconfigured;

        self.configure(gpu, surface, width, height)?;
        self.initialize(gpu, surface, executor)
    }

    /// Mark the chain stale so the next frame rebuilds it.
    pub fn mark_stale(&mut self) {
        if self.state == ChainState::Active {
            self.state = ChainState::Stale;
        }
    }

    /// Destroy the views and swapchain. The images belong to the swapchain.
    ///
    /// # Safety
    /// The device must be idle with respect to the chain.
    pub unsafe fn destroy(&mut self) {
        self.destroy_resources();
        self.state = ChainState::Destroyed;
    }

    unsafe fn destroy_resources(&mut self) {
        for view in self.views.drain(..) {
            self.device.destroy_image_view(view, None);
        }
        self.images.clear();
        if self.swapchain != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    fn require_active(&self, op: &str) -> Result<()> {
        match self.state {
            ChainState::Active => Ok(()),
            state => Err(GpuError::InvalidState(format!(
                "cannot {op} on a chain in state {state:?}"
            ))),
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Incremented every time a chain is built.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn preferences(&self) -> &ChainPreferences {
        &self.preferences
    }

    pub fn config(&self) -> Option<ChainConfig> {
        self.config
    }

    pub fn format(&self) -> vk::Format {
        self.config
            .map_or(vk::Format::UNDEFINED, |c| c.surface_format.format)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.config.map_or(vk::Extent2D::default(), |c| c.extent)
    }

    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        self.config.map(|c| c.present_mode)
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

unsafe fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    device
        .create_image_view(&view_info, None)
        .call("vkCreateImageView")
}

/// Choose the surface format.
///
/// Every available format that is requested and uses `color_space` replaces
/// the previous pick, so the last match in `available` wins. Without a match
/// the first available format is used. `None` only if `available` is empty.
pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    requested: &[vk::Format],
    color_space: vk::ColorSpaceKHR,
) -> Option<vk::SurfaceFormatKHR> {
    let mut chosen = None;
    for format in available {
        if requested.contains(&format.format) && format.color_space == color_space {
            chosen = Some(*format);
        }
    }
    chosen.or_else(|| available.first().copied())
}

/// Choose the present mode.
///
/// Walks `requested` in order; the last one the surface supports wins.
/// Falls back to FIFO, which is always available.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    let mut chosen = vk::PresentModeKHR::FIFO;
    for mode in requested {
        if available.contains(mode) {
            chosen = *mode;
        }
    }
    chosen
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, capped by the maximum when there is one.
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(min: u32, max: u32, current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn missing_preferred_format_falls_back_to_first() {
        let available = [
            fmt(vk::Format::R8G8B8A8_SRGB),
            fmt(vk::Format::B8G8R8A8_SRGB),
        ];
        let chosen = choose_surface_format(
            &available,
            &[vk::Format::B8G8R8A8_UNORM],
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )
        .unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_SRGB);
    }

    #[test]
    fn last_matching_format_wins() {
        let available = [
            fmt(vk::Format::B8G8R8A8_UNORM),
            fmt(vk::Format::R8G8B8A8_SRGB),
            fmt(vk::Format::B8G8R8A8_SRGB),
        ];
        let chosen = choose_surface_format(
            &available,
            &[vk::Format::B8G8R8A8_UNORM, vk::Format::B8G8R8A8_SRGB],
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )
        .unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn color_space_must_match() {
        let available = [
            fmt(vk::Format::R8G8B8A8_UNORM),
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            },
        ];
        let chosen = choose_surface_format(
            &available,
            &[vk::Format::B8G8R8A8_UNORM],
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )
        .unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn no_formats_yields_none() {
        assert!(choose_surface_format(
            &[],
            &[vk::Format::B8G8R8A8_UNORM],
            vk::ColorSpaceKHR::SRGB_NONLINEAR
        )
        .is_none());
    }

    #[test]
    fn present_mode_last_supported_request_wins() {
        let available = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        let requested = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&available, &requested),
            vk::PresentModeKHR::IMMEDIATE
        );

        let only_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&only_mailbox, &requested),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        assert_eq!(
            choose_present_mode(
                &[vk::PresentModeKHR::FIFO],
                &ChainPreferences::default().present_modes
            ),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let c = caps(2, 3, (1920, 1080));
        assert_eq!(
            calculate_extent(&c, 800, 600),
            vk::Extent2D {
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn extent_is_clamped_when_surface_defers() {
        let c = caps(2, 3, (u32::MAX, u32::MAX));
        assert_eq!(
            calculate_extent(&c, 8000, 600),
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );
    }

    #[test]
    fn image_count_respects_bounds() {
        assert_eq!(image_count(&caps(2, 0, (1, 1))), 3);
        assert_eq!(image_count(&caps(2, 8, (1, 1))), 3);
        assert_eq!(image_count(&caps(3, 3, (1, 1))), 3);
        assert_eq!(image_count(&caps(1, 1, (1, 1))), 1);
    }

    #[test]
    fn selection_is_stable_for_same_inputs() {
        let surface = SurfaceCapabilities {
            capabilities: caps(2, 0, (u32::MAX, u32::MAX)),
            formats: vec![fmt(vk::Format::B8G8R8A8_UNORM)],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };
        let prefs = ChainPreferences::default();
        let first = ChainConfig::select(&surface, &prefs, 1920, 1080).unwrap();
        let second = ChainConfig::select(&surface, &prefs, 1920, 1080).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            first.extent,
            vk::Extent2D {
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn selection_fails_without_formats() {
        let surface = SurfaceCapabilities {
            capabilities: caps(2, 0, (800, 600)),
            formats: Vec::new(),
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        assert!(matches!(
            ChainConfig::select(&surface, &ChainPreferences::default(), 800, 600),
            Err(GpuError::SwapchainCreation(_))
        ));
    }

    #[test]
    fn default_preferences() {
        let prefs = ChainPreferences::default();
        assert_eq!(prefs.formats, vec![vk::Format::B8G8R8A8_UNORM]);
        assert_eq!(prefs.target_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert!(layout_transition(vk::ImageLayout::UNDEFINED, prefs.target_layout).is_ok());
    }
}
