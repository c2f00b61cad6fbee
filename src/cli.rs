// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! This module provides command-line functionality for:
//! - Running the zero-copy capture pipeline
//! - Probing a capture device and the available dma-heaps

use chrono::Local;
use dmacam::backends::dma_heap::DmaHeap;
use dmacam::backends::v4l2::{CaptureDevice, FormatRequest};
use dmacam::config::PipelineConfig;
use dmacam::errors::PipelineResult;
use dmacam::gpu::egl::EglGles;
use dmacam::gpu::formats;
use dmacam::gpu::RenderSurface;
use dmacam::pipelines::{CapturePipeline, CapturedFrame, LoopAction, RenderStage};
use dmacam::snapshot;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use v4l::video::Capture;

/// Fills each output surface with a color that follows the frame sequence
/// and reports the frame rate once per second
struct ClearStage {
    started: Instant,
    last_report: Instant,
    frames: u64,
}

impl ClearStage {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_report: now,
            frames: 0,
        }
    }
}

impl RenderStage<EglGles> for ClearStage {
    fn render(
        &mut self,
        driver: &mut EglGles,
        input: &CapturedFrame<'_>,
        output: &RenderSurface,
    ) -> PipelineResult<LoopAction> {
        let phase = (input.sequence % 256) as f32 / 255.0;
        driver.clear_surface(output, [phase, 0.25, 1.0 - phase, 1.0]);

        self.frames += 1;
        if self.last_report.elapsed() >= Duration::from_secs(1) {
            let elapsed = self.started.elapsed().as_secs_f64();
            print!(
                "\rFrames: {}  ({:.1} fps, slot {})",
                self.frames,
                self.frames as f64 / elapsed.max(f64::EPSILON),
                input.slot
            );
            std::io::stdout().flush().ok();
            self.last_report = Instant::now();
        }
        Ok(LoopAction::Continue)
    }
}

/// Capture through the GPU until Ctrl+C or `frames` frames
pub fn run_capture(
    config: &PipelineConfig,
    frames: Option<u64>,
    dump: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = config.pipeline_options()?;
    let request = config.format_request()?;

    let heap = DmaHeap::open(&config.heap_paths)?;
    let device = CaptureDevice::open(&config.device, request, options.poll_timeout.is_some())?;
    let format = device.format().clone();
    let driver = EglGles::headless()?;

    println!("Device: {}", config.device.display());
    println!(
        "Capture format: {}x{} {} ({} plane(s), {} bytes per buffer)",
        format.width,
        format.height,
        format.pixel_format,
        format.num_planes(),
        format.buffer_size()
    );
    println!("dma-heap: {}", heap.path().display());

    let mut pipeline = CapturePipeline::setup(device, heap, driver, options)?;

    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    println!();
    println!("Capturing... (press Ctrl+C to stop)");
    let mut stage = ClearStage::new();
    let stats = pipeline.run(&mut stage, &stop_flag, frames);
    println!();

    let stats = stats?;
    println!(
        "Frames: {}, images imported: {}, retries: {}, poll timeouts: {}",
        stats.frames, stats.imports, stats.transient_retries, stats.timeouts
    );

    if let Some(target) = dump {
        match pipeline.last_output() {
            Some(index) => {
                let path = dump_path(target)?;
                let bytes = pipeline.read_output(index)?;
                let (width, height) = pipeline.output_size();
                snapshot::save(&bytes, pipeline.output_format(), width, height, &path)?;
                println!("Output frame saved: {}", path.display());
            }
            None => println!("No output frame to save"),
        }
    }

    pipeline.shutdown()?;
    Ok(())
}

/// A directory gets a timestamped PNG file name
fn dump_path(target: PathBuf) -> std::io::Result<PathBuf> {
    if target.is_dir() {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        return Ok(target.join(format!("frame_{}.png", timestamp)));
    }
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(target)
}

/// Print device identity, formats, the negotiated layout and the heap
pub fn probe(config: &PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dev = v4l::Device::with_path(&config.device)?;
    let caps = dev.query_caps()?;

    println!("Device: {}", config.device.display());
    println!("  Driver: {} {}.{}.{}", caps.driver, caps.version.0, caps.version.1, caps.version.2);
    println!("  Card:   {}", caps.card);
    println!("  Bus:    {}", caps.bus);
    println!("  Caps:   {}", caps.capabilities);
    println!();

    match dev.enum_formats() {
        Ok(descriptions) if !descriptions.is_empty() => {
            println!("Formats:");
            for desc in descriptions {
                let import = match formats::lookup_v4l2(desc.fourcc) {
                    Some(info) => format!("importable as {}", info.name),
                    None => "not importable".to_string(),
                };
                println!("  {} {:<32} {}", desc.fourcc, desc.description, import);
            }
        }
        Ok(_) => println!("Formats: none reported"),
        Err(e) => println!("Formats: enumeration failed ({})", e),
    }
    drop(dev);
    println!();

    let current = FormatRequest {
        width: 0,
        height: 0,
        pixel_format: None,
    };
    match CaptureDevice::open(&config.device, current, false) {
        Ok(device) => {
            let format = device.format();
            println!(
                "Current format: {}x{} {} ({:?})",
                format.width, format.height, format.pixel_format, format.mode
            );
            for (i, plane) in format.planes.iter().enumerate() {
                println!(
                    "  plane {}: {} bytes per line, {} bytes",
                    i, plane.bytesperline, plane.sizeimage
                );
            }
        }
        Err(e) => println!("Current format: {}", e),
    }
    println!();

    match DmaHeap::open(&config.heap_paths) {
        Ok(heap) => println!("dma-heap: {}", heap.path().display()),
        Err(e) => println!("dma-heap: {}", e),
    }

    Ok(())
}
