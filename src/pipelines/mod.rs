// SPDX-License-Identifier: GPL-3.0-only

//! Processing pipelines
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │ V4L2 device  │ ──▶ │ capture slot     │ ──▶ │ RenderStage      │
//! │ (DMABUF)     │     │ EGLImage +       │     │ draws into the   │
//! │              │ ◀── │ external texture │     │ output surface   │
//! └──────────────┘     └──────────────────┘     └──────────────────┘
//!        ▲ requeue             ▲ dma-heap buffers, never copied
//! ```
//!
//! - [`capture`]: setup, capture loop and teardown of the zero-copy path

pub mod capture;

pub use capture::{CapturePipeline, CapturedFrame, LoopAction, PipelineOptions, RenderStage, RunStats};
