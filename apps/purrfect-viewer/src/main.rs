//! Purrfect Engine Demo Viewer
//!
//! Clears the window through the main render pass and, when compiled shaders
//! are available, draws a spinning vertex-coloured quad.
//!
//! ## Usage
//!
//! ```bash
//! glslc apps/purrfect-viewer/shaders/quad.vert -o assets/shaders/quad.vert.spv
//! glslc apps/purrfect-viewer/shaders/quad.frag -o assets/shaders/quad.frag.spv
//! cargo run -p purrfect-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--vsync`: Present with FIFO
//! - `--shaders <DIR>`: Directory holding `quad.vert.spv` and `quad.frag.spv`
//!   (default: `assets/shaders`)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use purrfect_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let vsync = std::env::args().any(|arg| arg == "--vsync");

    run_app::<Viewer>(
        AppConfig::new("Purrfect Engine - Viewer")
            .with_size(WIDTH, HEIGHT)
            .with_vsync(vsync),
    )
}

fn print_help() {
    eprintln!(
        "Purrfect Engine Demo Viewer

USAGE:
    cargo run -p purrfect-viewer -- [OPTIONS]

OPTIONS:
    --vsync                 Present with FIFO
    --shaders <DIR>         Directory with quad.vert.spv and quad.frag.spv
                            Default: assets/shaders
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
