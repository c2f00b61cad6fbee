// SPDX-License-Identifier: GPL-3.0-only

//! Kernel ioctl surface of a capture device
//!
//! [`CaptureIo`] is the seam between the capture logic (format negotiation
//! and the buffer queue) and the kernel. [`V4l2Fd`] issues the real ioctls on
//! an open device node.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use v4l::FourCC;

use super::sys::{self, V4l2Buffer, V4l2Capability, V4l2Format, V4l2Plane, V4l2RequestBuffers};
use crate::constants::VIDEO_MAX_PLANES;

/// Which V4L2 capture API a device is driven through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    SinglePlanar,
    MultiPlanar,
}

impl CaptureMode {
    /// `enum v4l2_buf_type` value for this mode
    pub fn buf_type(&self) -> u32 {
        match self {
            CaptureMode::SinglePlanar => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            CaptureMode::MultiPlanar => sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }
}

/// Identity strings and capability flags reported by VIDIOC_QUERYCAP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    /// Device-node capabilities (`device_caps` when provided)
    pub capabilities: u32,
}

impl DeviceCaps {
    pub fn has(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }
}

/// Stride and size of one plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneFormat {
    pub bytesperline: u32,
    pub sizeimage: u32,
}

/// Mode-independent view of `struct v4l2_format`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFormat {
    pub mode: CaptureMode,
    pub width: u32,
    pub height: u32,
    pub pixel_format: FourCC,
    pub planes: Vec<PlaneFormat>,
}

/// Memory reference for one plane of a queued buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneRef {
    pub fd: RawFd,
    pub length: u32,
}

/// A buffer handed back by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub sequence: u32,
    pub bytesused: u32,
    pub flags: u32,
}

/// Capture-side kernel operations
pub trait CaptureIo {
    /// Device node, for error reports
    fn node(&self) -> &Path;

    fn query_caps(&mut self) -> io::Result<DeviceCaps>;

    fn get_format(&mut self, mode: CaptureMode) -> io::Result<RawFormat>;

    /// Apply geometry and pixel format; the driver may adjust them, so
    /// callers re-read with [`CaptureIo::get_format`]
    fn set_format(&mut self, format: &RawFormat) -> io::Result<()>;

    /// VIDIOC_REQBUFS with DMABUF memory, returns the granted count
    fn request_buffers(&mut self, mode: CaptureMode, count: u32) -> io::Result<u32>;

    fn queue_buffer(&mut self, mode: CaptureMode, index: u32, planes: &[PlaneRef]) -> io::Result<()>;

    fn dequeue_buffer(&mut self, mode: CaptureMode, num_planes: usize) -> io::Result<DequeuedBuffer>;

    fn stream_on(&mut self, mode: CaptureMode) -> io::Result<()>;

    fn stream_off(&mut self, mode: CaptureMode) -> io::Result<()>;

    /// Wait until a filled buffer is ready; `None` blocks indefinitely.
    /// Returns `false` on timeout.
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool>;
}

/// Real capture device backed by an open V4L2 node
#[derive(Debug)]
pub struct V4l2Fd {
    file: File,
    path: PathBuf,
}

impl V4l2Fd {
    pub fn new(file: File, path: &Path) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
        }
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
        let result = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg as *mut T) };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn read_format(&self, mode: CaptureMode) -> io::Result<V4l2Format> {
        let mut fmt: V4l2Format = unsafe { sys::zeroed() };
        fmt.type_ = mode.buf_type();
        self.ioctl(sys::VIDIOC_G_FMT, &mut fmt)?;
        Ok(fmt)
    }
}

impl AsRawFd for V4l2Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl CaptureIo for V4l2Fd {
    fn node(&self) -> &Path {
        &self.path
    }

    fn query_caps(&mut self) -> io::Result<DeviceCaps> {
        let mut cap: V4l2Capability = unsafe { sys::zeroed() };
        self.ioctl(sys::VIDIOC_QUERYCAP, &mut cap)?;
        Ok(DeviceCaps {
            driver: sys::c_string(&cap.driver),
            card: sys::c_string(&cap.card),
            bus_info: sys::c_string(&cap.bus_info),
            capabilities: cap.effective_caps(),
        })
    }

    fn get_format(&mut self, mode: CaptureMode) -> io::Result<RawFormat> {
        let fmt = self.read_format(mode)?;
        // SAFETY: the union member read matches the buffer type requested
        let format = match mode {
            CaptureMode::SinglePlanar => {
                let pix = unsafe { fmt.fmt.pix };
                RawFormat {
                    mode,
                    width: pix.width,
                    height: pix.height,
                    pixel_format: FourCC::from(pix.pixelformat),
                    planes: vec![PlaneFormat {
                        bytesperline: pix.bytesperline,
                        sizeimage: pix.sizeimage,
                    }],
                }
            }
            CaptureMode::MultiPlanar => {
                let mp = unsafe { fmt.fmt.pix_mp };
                let plane_fmt = mp.plane_fmt;
                let count = (mp.num_planes as usize).min(VIDEO_MAX_PLANES);
                RawFormat {
                    mode,
                    width: mp.width,
                    height: mp.height,
                    pixel_format: FourCC::from(mp.pixelformat),
                    planes: plane_fmt[..count]
                        .iter()
                        .map(|p| PlaneFormat {
                            bytesperline: p.bytesperline,
                            sizeimage: p.sizeimage,
                        })
                        .collect(),
                }
            }
        };
        Ok(format)
    }

    fn set_format(&mut self, format: &RawFormat) -> io::Result<()> {
        // Start from the driver's current format so field, colorspace and
        // quantization stay untouched
        let mut fmt = self.read_format(format.mode)?;
        let pixelformat: u32 = format.pixel_format.into();
        match format.mode {
            CaptureMode::SinglePlanar => {
                fmt.fmt.pix.width = format.width;
                fmt.fmt.pix.height = format.height;
                fmt.fmt.pix.pixelformat = pixelformat;
            }
            CaptureMode::MultiPlanar => {
                fmt.fmt.pix_mp.width = format.width;
                fmt.fmt.pix_mp.height = format.height;
                fmt.fmt.pix_mp.pixelformat = pixelformat;
            }
        }
        self.ioctl(sys::VIDIOC_S_FMT, &mut fmt)
    }

    fn request_buffers(&mut self, mode: CaptureMode, count: u32) -> io::Result<u32> {
        let mut req: V4l2RequestBuffers = unsafe { sys::zeroed() };
        req.count = count;
        req.type_ = mode.buf_type();
        req.memory = sys::V4L2_MEMORY_DMABUF;
        self.ioctl(sys::VIDIOC_REQBUFS, &mut req)?;
        Ok(req.count)
    }

    fn queue_buffer(&mut self, mode: CaptureMode, index: u32, planes: &[PlaneRef]) -> io::Result<()> {
        let first = planes
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "buffer without planes"))?;
        if planes.len() > VIDEO_MAX_PLANES {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "too many planes"));
        }

        let mut buf: V4l2Buffer = unsafe { sys::zeroed() };
        let mut plane_array: [V4l2Plane; VIDEO_MAX_PLANES] = unsafe { sys::zeroed() };
        buf.index = index;
        buf.type_ = mode.buf_type();
        buf.memory = sys::V4L2_MEMORY_DMABUF;

        match mode {
            CaptureMode::SinglePlanar => {
                buf.m.fd = first.fd;
                buf.length = first.length;
            }
            CaptureMode::MultiPlanar => {
                for (slot, plane) in plane_array.iter_mut().zip(planes) {
                    slot.m.fd = plane.fd;
                    slot.length = plane.length;
                }
                buf.m.planes = plane_array.as_mut_ptr();
                buf.length = planes.len() as u32;
            }
        }

        self.ioctl(sys::VIDIOC_QBUF, &mut buf)
    }

    fn dequeue_buffer(&mut self, mode: CaptureMode, num_planes: usize) -> io::Result<DequeuedBuffer> {
        let mut buf: V4l2Buffer = unsafe { sys::zeroed() };
        let mut plane_array: [V4l2Plane; VIDEO_MAX_PLANES] = unsafe { sys::zeroed() };
        buf.type_ = mode.buf_type();
        buf.memory = sys::V4L2_MEMORY_DMABUF;

        if mode == CaptureMode::MultiPlanar {
            buf.m.planes = plane_array.as_mut_ptr();
            buf.length = num_planes.clamp(1, VIDEO_MAX_PLANES) as u32;
        }

        self.ioctl(sys::VIDIOC_DQBUF, &mut buf)?;

        let bytesused = match mode {
            CaptureMode::SinglePlanar => buf.bytesused,
            CaptureMode::MultiPlanar => plane_array[..(buf.length as usize).min(VIDEO_MAX_PLANES)]
                .iter()
                .map(|p| p.bytesused)
                .sum(),
        };

        Ok(DequeuedBuffer {
            index: buf.index,
            sequence: buf.sequence,
            bytesused,
            flags: buf.flags,
        })
    }

    fn stream_on(&mut self, mode: CaptureMode) -> io::Result<()> {
        let mut buf_type = mode.buf_type() as libc::c_int;
        self.ioctl(sys::VIDIOC_STREAMON, &mut buf_type)
    }

    fn stream_off(&mut self, mode: CaptureMode) -> io::Result<()> {
        let mut buf_type = mode.buf_type() as libc::c_int;
        self.ioctl(sys::VIDIOC_STREAMOFF, &mut buf_type)
    }

    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout
            .map(|t| t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let result = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        if pfd.revents & libc::POLLERR != 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device reported POLLERR"));
        }
        Ok(result > 0)
    }
}
