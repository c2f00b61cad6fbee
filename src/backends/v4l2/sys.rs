// SPDX-License-Identifier: GPL-3.0-only

//! Raw V4L2 ioctl definitions
//!
//! Layouts match `include/uapi/linux/videodev2.h` on 64-bit Linux. Only the
//! parts of the API needed for DMABUF streaming capture are declared.

#![allow(dead_code)]

use crate::constants::VIDEO_MAX_PLANES;

// ===== Capability flags =====

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

// ===== Buffer types / memory =====

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

// ===== ioctl numbers =====
// Calculated as: (dir << 30) | (size << 16) | ('V' << 8) | nr

/// _IOR('V', 0, struct v4l2_capability) - 104 bytes
pub const VIDIOC_QUERYCAP: libc::c_ulong = 0x8068_5600;
/// _IOWR('V', 4, struct v4l2_format) - 208 bytes
pub const VIDIOC_G_FMT: libc::c_ulong = 0xc0d0_5604;
/// _IOWR('V', 5, struct v4l2_format)
pub const VIDIOC_S_FMT: libc::c_ulong = 0xc0d0_5605;
/// _IOWR('V', 8, struct v4l2_requestbuffers) - 20 bytes
pub const VIDIOC_REQBUFS: libc::c_ulong = 0xc014_5608;
/// _IOWR('V', 15, struct v4l2_buffer) - 88 bytes
pub const VIDIOC_QBUF: libc::c_ulong = 0xc058_560f;
/// _IOWR('V', 17, struct v4l2_buffer)
pub const VIDIOC_DQBUF: libc::c_ulong = 0xc058_5611;
/// _IOW('V', 18, int)
pub const VIDIOC_STREAMON: libc::c_ulong = 0x4004_5612;
/// _IOW('V', 19, int)
pub const VIDIOC_STREAMOFF: libc::c_ulong = 0x4004_5613;

// ===== Structures =====

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

impl V4l2Capability {
    /// Capabilities of this device node rather than the whole physical device
    pub fn effective_caps(&self) -> u32 {
        if self.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }
}

/// Decode a NUL-padded kernel string
pub fn c_string(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).to_string()
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct V4l2PlanePixFormat {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct V4l2PixFormatMplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [V4l2PlanePixFormat; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

/// `fmt` union of `struct v4l2_format`. The kernel union holds pointers
/// (`struct v4l2_window`), hence the 8-byte alignment member.
#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2FormatUnion {
    pub pix: V4l2PixFormat,
    pub pix_mp: V4l2PixFormatMplane,
    pub raw_data: [u8; 200],
    _align: [u64; 25],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Format {
    pub type_: u32,
    pub fmt: V4l2FormatUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2PlaneMemory {
    pub mem_offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: V4l2PlaneMemory,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferMemory {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub planes: *mut V4l2Plane,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferMemory,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

/// Zero-initialise an ioctl argument struct.
///
/// # Safety
///
/// `T` must be one of the plain-data structs above, for which the all-zero
/// bit pattern is valid.
pub(crate) unsafe fn zeroed<T: Copy>() -> T {
    unsafe { std::mem::zeroed() }
}
