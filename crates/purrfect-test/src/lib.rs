//! Test harness for the Purrfect engine.
//!
//! Provides a headless GPU context for integration tests that need a real
//! Vulkan device. Such tests are `#[ignore]`d by default; run them with
//! `cargo test -p purrfect-test -- --ignored` on a machine with a GPU.

pub mod harness;

pub use harness::{solid_rgba, HeadlessGpu};

use purrfect_gpu::GpuError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Readback failed: {0}")]
    Readback(String),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;
