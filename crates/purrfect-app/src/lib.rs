//! Application framework for the Purrfect engine.
//!
//! This crate provides a trait-based application framework that handles:
//! - Window creation and management
//! - Renderer initialization and teardown
//! - Frame pacing and presentation chain recreation
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use purrfect_app::{run_app, AppConfig, AppContext, FrameContext, PurrApp};
//!
//! struct MyApp;
//!
//! impl PurrApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, ctx: &mut AppContext, _frame: &FrameContext) -> anyhow::Result<()> {
//!         ctx.renderer.begin_main_pass([0.1, 0.1, 0.1, 1.0])?;
//!         ctx.renderer.end_main_pass()?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::PurrApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

pub use ash::vk;
pub use purrfect_gpu as gpu;
pub use purrfect_platform as platform;
