// SPDX-License-Identifier: GPL-3.0-only

//! Capture device opening and format negotiation

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::{debug, info};
use v4l::FourCC;

use super::io::{CaptureIo, CaptureMode, DeviceCaps, PlaneFormat, RawFormat, V4l2Fd};
use super::sys;
use crate::errors::{PipelineError, PipelineResult};

/// Geometry and pixel format asked of the driver.
///
/// Zero width/height or a `None` pixel format keep the driver's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<FourCC>,
}

/// Format accepted by the driver, fixed for the lifetime of the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    pub mode: CaptureMode,
    pub pixel_format: FourCC,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneFormat>,
}

impl CaptureFormat {
    pub fn num_planes(&self) -> usize {
        self.planes.len().max(1)
    }

    /// Bytes needed to back one capture buffer holding every plane
    pub fn buffer_size(&self) -> usize {
        self.planes.iter().map(|p| p.sizeimage as usize).sum()
    }

    /// Row stride of the first plane as reported by the driver
    pub fn stride(&self) -> Option<u32> {
        self.planes.first().map(|p| p.bytesperline).filter(|&b| b > 0)
    }
}

impl From<RawFormat> for CaptureFormat {
    fn from(raw: RawFormat) -> Self {
        Self {
            mode: raw.mode,
            pixel_format: raw.pixel_format,
            width: raw.width,
            height: raw.height,
            planes: raw.planes,
        }
    }
}

/// An open capture device with its negotiated format
#[derive(Debug)]
pub struct CaptureDevice<D: CaptureIo> {
    io: D,
    caps: DeviceCaps,
    format: CaptureFormat,
}

impl CaptureDevice<V4l2Fd> {
    /// Open a V4L2 node and negotiate the capture format.
    ///
    /// With `nonblocking` the node is opened `O_NONBLOCK` so a dequeue with
    /// nothing ready reports `EAGAIN` instead of sleeping in the kernel.
    pub fn open(path: &Path, request: FormatRequest, nonblocking: bool) -> PipelineResult<Self> {
        std::fs::metadata(path).map_err(|source| PipelineError::DeviceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if nonblocking {
            options.custom_flags(libc::O_NONBLOCK);
        }
        let file = options.open(path).map_err(|source| PipelineError::DeviceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), nonblocking, "Opened capture device");
        Self::with_io(V4l2Fd::new(file, path), request)
    }
}

impl<D: CaptureIo> CaptureDevice<D> {
    /// Negotiate a capture format over an already-open device.
    ///
    /// The capture API is chosen once here: single-planar when the device
    /// advertises it, multi-planar otherwise.
    pub fn with_io(mut io: D, request: FormatRequest) -> PipelineResult<Self> {
        let caps = io.query_caps().map_err(|source| PipelineError::DeviceUnavailable {
            path: io.node().to_path_buf(),
            source,
        })?;

        let mode = if caps.has(sys::V4L2_CAP_VIDEO_CAPTURE) {
            CaptureMode::SinglePlanar
        } else if caps.has(sys::V4L2_CAP_VIDEO_CAPTURE_MPLANE) {
            CaptureMode::MultiPlanar
        } else {
            return Err(PipelineError::UnsupportedCapability {
                capabilities: caps.capabilities,
            });
        };

        info!(
            driver = %caps.driver,
            card = %caps.card,
            bus = %caps.bus_info,
            mode = ?mode,
            "Capture device capabilities"
        );

        let mut desired = io
            .get_format(mode)
            .map_err(|source| PipelineError::FormatNegotiationFailed {
                stage: "VIDIOC_G_FMT",
                source,
            })?;

        if request.width > 0 {
            desired.width = request.width;
        }
        if request.height > 0 {
            desired.height = request.height;
        }
        if let Some(fourcc) = request.pixel_format {
            desired.pixel_format = fourcc;
        }

        io.set_format(&desired)
            .map_err(|source| PipelineError::FormatNegotiationFailed {
                stage: "VIDIOC_S_FMT",
                source,
            })?;

        let negotiated = io
            .get_format(mode)
            .map_err(|source| PipelineError::FormatNegotiationFailed {
                stage: "VIDIOC_G_FMT",
                source,
            })?;

        let format = CaptureFormat::from(negotiated);
        log_format(&format, &desired);

        Ok(Self { io, caps, format })
    }

    pub fn format(&self) -> &CaptureFormat {
        &self.format
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn mode(&self) -> CaptureMode {
        self.format.mode
    }

    pub(crate) fn io_mut(&mut self) -> &mut D {
        &mut self.io
    }

    pub fn into_io(self) -> D {
        self.io
    }
}

fn log_format(format: &CaptureFormat, desired: &RawFormat) {
    if format.width != desired.width || format.height != desired.height {
        info!(
            requested = format!("{}x{}", desired.width, desired.height),
            accepted = format!("{}x{}", format.width, format.height),
            "Driver adjusted capture size"
        );
    }

    info!(
        size = format!("{}x{}", format.width, format.height),
        fourcc = %format.pixel_format,
        planes = format.planes.len(),
        buffer_size = format.buffer_size(),
        "Negotiated capture format"
    );
    for (i, plane) in format.planes.iter().enumerate() {
        debug!(
            plane = i,
            bytesperline = plane.bytesperline,
            sizeimage = plane.sizeimage,
            "Capture plane"
        );
    }
}
