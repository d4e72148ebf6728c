//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Every variant except the "stale surface" condition (which is reported
/// through [`crate::swapchain::AcquireOutcome`] and
/// [`crate::swapchain::PresentOutcome`] instead) is unrecoverable for the
/// frame loop.
#[derive(Error, Debug)]
pub enum GpuError {
    /// A specific Vulkan call failed.
    #[error("{call} failed: {result}")]
    Call {
        /// Name of the failing entry point.
        call: &'static str,
        /// The result code returned by the driver.
        result: vk::Result,
    },

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// The window kept a zero-sized framebuffer.
    #[error("Framebuffer still zero-sized after {waits} waits")]
    DrawableUnavailable { waits: u32 },

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader bytecode could not be loaded.
    #[error("Shader load failed: {0}")]
    ShaderLoad(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Image layout transition outside the supported set.
    #[error("Unsupported image layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    /// Format lacks a feature the operation needs.
    #[error("Format {format:?} does not support {feature}")]
    UnsupportedFormat {
        format: vk::Format,
        feature: &'static str,
    },

    /// Descriptor pool has no room for another set.
    #[error("Descriptor pool exhausted: {0}")]
    PoolExhausted(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Attach the name of the failing Vulkan entry point to a raw result.
pub trait VkResultExt<T> {
    /// Map a `vk::Result` error into [`GpuError::Call`].
    fn call(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn call(self, call: &'static str) -> Result<T> {
        self.map_err(|result| GpuError::Call { call, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_names_the_entry_point() {
        let raw: std::result::Result<(), vk::Result> = Err(vk::Result::ERROR_DEVICE_LOST);
        let err = raw.call("vkQueueSubmit").unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("vkQueueSubmit failed"), "{text}");
        assert!(matches!(
            err,
            GpuError::Call {
                result: vk::Result::ERROR_DEVICE_LOST,
                ..
            }
        ));
    }

    #[test]
    fn transition_error_mentions_both_layouts() {
        let err = GpuError::UnsupportedLayoutTransition {
            old: vk::ImageLayout::PRESENT_SRC_KHR,
            new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        };
        let text = err.to_string();
        assert!(text.contains("PRESENT_SRC_KHR"));
        assert!(text.contains("TRANSFER_DST_OPTIMAL"));
    }
}
