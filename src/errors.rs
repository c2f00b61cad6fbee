// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the capture pipeline

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::backends::dma_heap::BufferId;
use crate::gpu::formats::DrmFourcc;

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Capture queue operation that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    RequestBuffers,
    Queue,
    Dequeue,
    Poll,
    StreamOn,
    StreamOff,
}

impl QueueOp {
    pub fn ioctl_name(&self) -> &'static str {
        match self {
            QueueOp::RequestBuffers => "VIDIOC_REQBUFS",
            QueueOp::Queue => "VIDIOC_QBUF",
            QueueOp::Dequeue => "VIDIOC_DQBUF",
            QueueOp::Poll => "poll",
            QueueOp::StreamOn => "VIDIOC_STREAMON",
            QueueOp::StreamOff => "VIDIOC_STREAMOFF",
        }
    }
}

/// Main pipeline error type
#[derive(Debug)]
pub enum PipelineError {
    /// Device node is missing or could not be opened
    DeviceUnavailable { path: PathBuf, source: io::Error },
    /// Device reports neither single- nor multi-planar capture
    UnsupportedCapability { capabilities: u32 },
    /// VIDIOC_G_FMT / VIDIOC_S_FMT sequence failed
    FormatNegotiationFailed { stage: &'static str, source: io::Error },
    /// None of the dma-heap candidates could be opened
    HeapUnavailable { tried: Vec<PathBuf> },
    /// The heap refused an allocation
    AllocationFailed { size: usize, source: io::Error },
    /// Pixel format is not in the import table
    UnsupportedPixelFormat(DrmFourcc),
    /// GPU driver returned no image
    ImageImportFailed { format: DrmFourcc, code: u32 },
    /// The same buffer was imported while an image for it is still alive
    DuplicateImport(BufferId),
    /// Buffer is smaller than the layout described for the import
    BufferTooSmall { required: u64, actual: usize },
    /// Binding an image to a renderbuffer/texture/framebuffer was rejected
    AttachmentFailed { stage: &'static str, code: u32 },
    /// Framebuffer completeness check failed after binding
    FramebufferIncomplete { status: u32 },
    /// Queue/stream ioctl failed
    QueueOperationFailed { op: QueueOp, detail: String, source: Option<io::Error> },
    /// Retry-class errno during dequeue/enqueue
    TransientIOError { op: QueueOp, source: io::Error },
    /// CPU access to a dma-buf (mmap / sync) failed
    BufferAccessFailed(io::Error),
    /// EGL/GLES could not be initialised
    GpuUnavailable(String),
    /// Configuration file could not be read or parsed
    Config(String),
    /// Output frame could not be written as an image file
    Snapshot(image::ImageError),
}

impl PipelineError {
    /// Build a queue error from an ioctl failure, classifying retry-class errnos
    pub fn queue(op: QueueOp, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => PipelineError::TransientIOError { op, source: err },
            _ => PipelineError::QueueOperationFailed {
                op,
                detail: err.to_string(),
                source: Some(err),
            },
        }
    }

    /// Queue protocol violation that did not come from the kernel
    pub fn queue_state(op: QueueOp, detail: impl Into<String>) -> Self {
        PipelineError::QueueOperationFailed {
            op,
            detail: detail.into(),
            source: None,
        }
    }

    /// Whether the capture loop should retry instead of aborting
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientIOError { .. })
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::DeviceUnavailable { path, source } => {
                write!(f, "Device unavailable: {}: {}", path.display(), source)
            }
            PipelineError::UnsupportedCapability { capabilities } => write!(
                f,
                "Device does not support video capture (capabilities {:#010x})",
                capabilities
            ),
            PipelineError::FormatNegotiationFailed { stage, source } => {
                write!(f, "Format negotiation failed at {}: {}", stage, source)
            }
            PipelineError::HeapUnavailable { tried } => {
                let paths: Vec<String> = tried.iter().map(|p| p.display().to_string()).collect();
                write!(f, "No dma-heap could be opened (tried {})", paths.join(", "))
            }
            PipelineError::AllocationFailed { size, source } => {
                write!(f, "Failed to allocate {} byte dma-buf: {}", size, source)
            }
            PipelineError::UnsupportedPixelFormat(format) => {
                write!(f, "Unsupported pixel format: {}", format)
            }
            PipelineError::ImageImportFailed { format, code } => {
                write!(f, "Failed to import {} image (driver error {:#06x})", format, code)
            }
            PipelineError::DuplicateImport(id) => {
                write!(f, "Buffer {} already has a live imported image", id)
            }
            PipelineError::BufferTooSmall { required, actual } => write!(
                f,
                "Buffer too small for layout: need {} bytes, have {}",
                required, actual
            ),
            PipelineError::AttachmentFailed { stage, code } => {
                write!(f, "Attachment failed at {} (GL error {:#06x})", stage, code)
            }
            PipelineError::FramebufferIncomplete { status } => {
                write!(f, "Framebuffer incomplete (status {:#06x})", status)
            }
            PipelineError::QueueOperationFailed { op, detail, .. } => {
                write!(f, "{} failed: {}", op.ioctl_name(), detail)
            }
            PipelineError::TransientIOError { op, source } => {
                write!(f, "{} interrupted: {}", op.ioctl_name(), source)
            }
            PipelineError::BufferAccessFailed(err) => write!(f, "Buffer access failed: {}", err),
            PipelineError::GpuUnavailable(msg) => write!(f, "GPU unavailable: {}", msg),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::Snapshot(err) => write!(f, "Failed to write output frame: {}", err),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::DeviceUnavailable { source, .. }
            | PipelineError::FormatNegotiationFailed { source, .. }
            | PipelineError::AllocationFailed { source, .. }
            | PipelineError::TransientIOError { source, .. } => Some(source),
            PipelineError::QueueOperationFailed { source, .. } => {
                source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
            }
            PipelineError::BufferAccessFailed(err) => Some(err),
            PipelineError::Snapshot(err) => Some(err),
            _ => None,
        }
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        PipelineError::Snapshot(err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}
