// SPDX-License-Identifier: GPL-3.0-only

//! Pixel format table for dma-buf image import
//!
//! Every importable format is described by data: how many planes it has,
//! where each plane starts and how long its rows are, and which YUV
//! color-space hints the driver needs. The importer consults this table and
//! never branches on the format itself.

use std::fmt;

use v4l::FourCC;

/// DRM fourcc code (`drm_fourcc.h`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrmFourcc(pub u32);

impl DrmFourcc {
    pub const NV12: DrmFourcc = DrmFourcc::from_bytes(b"NV12");
    pub const YUV420: DrmFourcc = DrmFourcc::from_bytes(b"YU12");
    pub const YUYV: DrmFourcc = DrmFourcc::from_bytes(b"YUYV");
    pub const R8: DrmFourcc = DrmFourcc::from_bytes(b"R8  ");
    pub const RG88: DrmFourcc = DrmFourcc::from_bytes(b"RG88");
    pub const RGB888: DrmFourcc = DrmFourcc::from_bytes(b"RG24");
    pub const RGBA8888: DrmFourcc = DrmFourcc::from_bytes(b"RA24");

    pub const fn from_bytes(code: &[u8; 4]) -> Self {
        DrmFourcc(u32::from_le_bytes(*code))
    }

    /// Parse a fourcc written as up to four ASCII characters ("R8" is
    /// padded with spaces) or as a table name such as "RGBA8888"
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(info) = FORMATS.iter().find(|f| f.name.eq_ignore_ascii_case(text)) {
            return Some(info.drm);
        }
        let bytes = text.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 {
            return None;
        }
        let mut code = [b' '; 4];
        code[..bytes.len()].copy_from_slice(bytes);
        Some(DrmFourcc::from_bytes(&code))
    }
}

impl fmt::Display for DrmFourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(f, "{}", String::from_utf8_lossy(&bytes).trim_end())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

/// `a * num / den` with u64 intermediates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    pub num: u32,
    pub den: u32,
}

impl Ratio {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn apply(&self, value: u64) -> u64 {
        value * self.num as u64 / self.den as u64
    }

    /// Inverse of [`Ratio::apply`], used to turn a byte stride back into a
    /// row width in pixels
    pub fn invert(&self, value: u64) -> u64 {
        value * self.den as u64 / self.num as u64
    }
}

/// Plane placement rule: offset as a multiple of `width * height`, pitch as
/// a multiple of `width`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneRule {
    pub offset: Ratio,
    pub pitch: Ratio,
}

const fn plane(offset: (u32, u32), pitch: (u32, u32)) -> PlaneRule {
    PlaneRule {
        offset: Ratio::new(offset.0, offset.1),
        pitch: Ratio::new(pitch.0, pitch.1),
    }
}

/// `EGL_YUV_COLOR_SPACE_HINT_EXT` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YuvColorSpace {
    Rec601,
    Rec709,
    Rec2020,
}

/// `EGL_SAMPLE_RANGE_HINT_EXT` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRange {
    Full,
    Narrow,
}

/// Chroma interpretation the driver cannot infer from the raw layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorHints {
    pub color_space: YuvColorSpace,
    pub range: SampleRange,
}

const BT709_FULL: Option<ColorHints> = Some(ColorHints {
    color_space: YuvColorSpace::Rec709,
    range: SampleRange::Full,
});

/// One importable format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub name: &'static str,
    pub drm: DrmFourcc,
    /// Matching V4L2 pixel format, when capture devices produce it
    pub v4l2: Option<[u8; 4]>,
    pub planes: &'static [PlaneRule],
    /// Bytes per frame as a multiple of `width * height`
    pub frame_size: Ratio,
    pub color: Option<ColorHints>,
}

/// Byte position and row length of one plane inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u64,
    pub pitch: u64,
}

impl FormatInfo {
    /// Plane layouts for a `width` x `height` frame whose rows are laid out
    /// `row_width` pixels apart (equal to `width` unless the driver padded)
    pub fn plane_layouts(&self, row_width: u32, height: u32) -> Vec<PlaneLayout> {
        let area = row_width as u64 * height as u64;
        self.planes
            .iter()
            .map(|rule| PlaneLayout {
                offset: rule.offset.apply(area),
                pitch: rule.pitch.apply(row_width as u64),
            })
            .collect()
    }

    pub fn frame_size(&self, width: u32, height: u32) -> u64 {
        self.frame_size.apply(width as u64 * height as u64)
    }

    /// Row width in pixels implied by a first-plane byte stride
    pub fn row_width_for_stride(&self, stride: u32) -> u64 {
        self.planes
            .first()
            .map(|rule| rule.pitch.invert(stride as u64))
            .unwrap_or(stride as u64)
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }
}

/// Every format the importer understands
pub static FORMATS: &[FormatInfo] = &[
    FormatInfo {
        name: "NV12",
        drm: DrmFourcc::NV12,
        v4l2: Some(*b"NV12"),
        planes: &[plane((0, 1), (1, 1)), plane((1, 1), (1, 2))],
        frame_size: Ratio::new(3, 2),
        color: BT709_FULL,
    },
    FormatInfo {
        name: "YUV420",
        drm: DrmFourcc::YUV420,
        v4l2: Some(*b"YU12"),
        planes: &[
            plane((0, 1), (1, 1)),
            plane((1, 1), (1, 2)),
            plane((5, 4), (1, 2)),
        ],
        frame_size: Ratio::new(3, 2),
        color: BT709_FULL,
    },
    FormatInfo {
        name: "YUYV",
        drm: DrmFourcc::YUYV,
        v4l2: Some(*b"YUYV"),
        planes: &[plane((0, 1), (2, 1))],
        frame_size: Ratio::new(2, 1),
        color: BT709_FULL,
    },
    FormatInfo {
        name: "R8",
        drm: DrmFourcc::R8,
        v4l2: Some(*b"GREY"),
        planes: &[plane((0, 1), (1, 1))],
        frame_size: Ratio::new(1, 1),
        color: None,
    },
    FormatInfo {
        name: "RG88",
        drm: DrmFourcc::RG88,
        v4l2: None,
        planes: &[plane((0, 1), (2, 1))],
        frame_size: Ratio::new(2, 1),
        color: None,
    },
    FormatInfo {
        name: "RGB888",
        drm: DrmFourcc::RGB888,
        v4l2: Some(*b"BGR3"),
        planes: &[plane((0, 1), (3, 1))],
        frame_size: Ratio::new(3, 1),
        color: None,
    },
    FormatInfo {
        name: "RGBA8888",
        drm: DrmFourcc::RGBA8888,
        v4l2: None,
        planes: &[plane((0, 1), (4, 1))],
        frame_size: Ratio::new(4, 1),
        color: None,
    },
];

pub fn lookup(drm: DrmFourcc) -> Option<&'static FormatInfo> {
    FORMATS.iter().find(|f| f.drm == drm)
}

/// Importable format for a V4L2 capture pixel format
pub fn lookup_v4l2(fourcc: FourCC) -> Option<&'static FormatInfo> {
    FORMATS.iter().find(|f| f.v4l2 == Some(fourcc.repr))
}
