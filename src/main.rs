// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use dmacam::config::{ConfigOverrides, PipelineConfig};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser)]
#[command(name = "dmacam")]
#[command(about = "Zero-copy V4L2 capture into OpenGL ES textures")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/dmacam/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames through the GPU until Ctrl+C
    Run {
        /// Capture device node
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Capture width
        #[arg(long)]
        width: Option<u32>,

        /// Capture height
        #[arg(long)]
        height: Option<u32>,

        /// V4L2 pixel format fourcc, e.g. NV12
        #[arg(short, long)]
        format: Option<String>,

        /// Capture buffers to cycle
        #[arg(short, long)]
        buffers: Option<u32>,

        /// Output surfaces to render into
        #[arg(long)]
        outputs: Option<u32>,

        /// Output surface format (DRM fourcc or name, e.g. RGBA8888)
        #[arg(long)]
        output_format: Option<String>,

        /// Poll timeout in milliseconds, 0 blocks in the driver
        #[arg(long)]
        poll_timeout: Option<u64>,

        /// Stop after this many frames
        #[arg(short = 'n', long)]
        frames: Option<u64>,

        /// Write the last output surface to this file or directory on exit
        #[arg(long)]
        dump: Option<PathBuf>,
    },

    /// Show device capabilities, formats and the dma-heap that would be used
    Probe {
        /// Capture device node
        #[arg(short, long)]
        device: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=dmacam=debug, RUST_LOG=warn
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let mut config = match PipelineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Run {
            device,
            width,
            height,
            format,
            buffers,
            outputs,
            output_format,
            poll_timeout,
            frames,
            dump,
        } => {
            config.apply(&ConfigOverrides {
                device,
                width,
                height,
                pixel_format: format,
                buffer_count: buffers,
                output_count: outputs,
                output_format,
                poll_timeout_ms: poll_timeout,
            });
            cli::run_capture(&config, frames, dump)
        }
        Commands::Probe { device } => {
            config.apply(&ConfigOverrides {
                device,
                ..Default::default()
            });
            cli::probe(&config)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
