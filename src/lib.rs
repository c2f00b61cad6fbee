// SPDX-License-Identifier: GPL-3.0-only

//! dmacam - zero-copy V4L2 capture into OpenGL ES
//!
//! Frames are captured into dma-heap buffers and handed to the GPU as
//! `EGL_LINUX_DMA_BUF_EXT` images, so pixel data never passes through the
//! CPU on its way from the sensor to a texture.
//!
//! # Architecture
//!
//! - [`backends`]: V4L2 capture device and queue, dma-heap allocator
//! - [`gpu`]: format table, image import, render targets, EGL/GLES driver
//! - [`pipelines`]: capture pipeline setup, loop and teardown
//! - [`config`]: user configuration handling
//! - [`snapshot`]: writing output surfaces to image files

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod gpu;
pub mod pipelines;
pub mod snapshot;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use errors::{PipelineError, PipelineResult};
pub use pipelines::{CapturePipeline, LoopAction, PipelineOptions, RenderStage, RunStats};
