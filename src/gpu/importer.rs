// SPDX-License-Identifier: GPL-3.0-only

//! dma-buf to GPU image import

use std::collections::HashSet;
use std::os::fd::RawFd;

use tracing::{debug, warn};

use super::formats::{self, ColorHints, DrmFourcc, SampleRange, YuvColorSpace};
use super::{GpuDriver, GpuImage};
use crate::backends::dma_heap::{BufferId, BufferRef};
use crate::errors::{PipelineError, PipelineResult};

// EGL_EXT_image_dma_buf_import
pub const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
pub const EGL_LINUX_DRM_FOURCC_EXT: i64 = 0x3271;
const EGL_DMA_BUF_PLANE_ATTRIBS: [[i64; 3]; 3] = [
    [0x3272, 0x3273, 0x3274],
    [0x3275, 0x3276, 0x3277],
    [0x3278, 0x3279, 0x327A],
];
pub const EGL_YUV_COLOR_SPACE_HINT_EXT: i64 = 0x327B;
pub const EGL_SAMPLE_RANGE_HINT_EXT: i64 = 0x327C;
const EGL_ITU_REC601_EXT: i64 = 0x327F;
const EGL_ITU_REC709_EXT: i64 = 0x3280;
const EGL_ITU_REC2020_EXT: i64 = 0x3281;
const EGL_YUV_FULL_RANGE_EXT: i64 = 0x3282;
const EGL_YUV_NARROW_RANGE_EXT: i64 = 0x3283;
pub const EGL_WIDTH: i64 = 0x3057;
pub const EGL_HEIGHT: i64 = 0x3056;
pub const EGL_NONE: i64 = 0x3038;

/// Frame dimensions for an import. `stride` is the first-plane row length in
/// bytes when the producer padded its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub stride: Option<u32>,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stride: None,
        }
    }

    pub fn with_stride(mut self, stride: Option<u32>) -> Self {
        self.stride = stride;
        self
    }
}

/// Where one plane of an imported image lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportedPlane {
    pub fd: RawFd,
    pub offset: u64,
    pub pitch: u64,
}

/// A GPU image created from a buffer handle, with the layout used to build it
#[derive(Debug, PartialEq, Eq)]
pub struct ImportedImage {
    pub image: GpuImage,
    pub buffer: BufferId,
    pub format: DrmFourcc,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<ImportedPlane>,
    pub color: Option<ColorHints>,
}

/// Tracks which buffers currently have a live GPU image
#[derive(Debug, Default)]
pub struct ImageImporter {
    live: HashSet<BufferId>,
}

impl ImageImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import `buffer` as a `width` x `height` image of `format`.
    ///
    /// Format and size are validated before the driver is called. A buffer
    /// can only have one live image at a time.
    pub fn import<G: GpuDriver + ?Sized>(
        &mut self,
        driver: &mut G,
        buffer: BufferRef,
        format: DrmFourcc,
        geometry: Geometry,
    ) -> PipelineResult<ImportedImage> {
        let info = formats::lookup(format).ok_or(PipelineError::UnsupportedPixelFormat(format))?;

        if self.live.contains(&buffer.id) {
            return Err(PipelineError::DuplicateImport(buffer.id));
        }

        let row_width = geometry
            .stride
            .map(|s| info.row_width_for_stride(s))
            .unwrap_or(geometry.width as u64)
            .max(geometry.width as u64);
        let required = info.frame_size.apply(row_width * geometry.height as u64);
        if (buffer.size as u64) < required {
            return Err(PipelineError::BufferTooSmall {
                required,
                actual: buffer.size,
            });
        }

        let planes: Vec<ImportedPlane> = info
            .plane_layouts(row_width as u32, geometry.height)
            .into_iter()
            .map(|layout| ImportedPlane {
                fd: buffer.fd,
                offset: layout.offset,
                pitch: layout.pitch,
            })
            .collect();

        let attribs = attribute_list(format, geometry, &planes, info.color);
        let image = driver
            .create_image(&attribs)
            .map_err(|e| PipelineError::ImageImportFailed { format, code: e.code() })?;

        debug!(
            buffer = %buffer.id,
            format = %format,
            size = format!("{}x{}", geometry.width, geometry.height),
            planes = planes.len(),
            "Imported dma-buf image"
        );

        self.live.insert(buffer.id);
        Ok(ImportedImage {
            image,
            buffer: buffer.id,
            format,
            width: geometry.width,
            height: geometry.height,
            planes,
            color: info.color,
        })
    }

    /// Destroy the GPU image; the buffer may be imported again afterwards
    pub fn release<G: GpuDriver + ?Sized>(&mut self, driver: &mut G, image: ImportedImage) {
        if !self.live.remove(&image.buffer) {
            warn!(buffer = %image.buffer, "Releasing image the importer does not track");
        }
        driver.destroy_image(image.image);
    }

    pub fn is_live(&self, buffer: BufferId) -> bool {
        self.live.contains(&buffer)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// `EGL_NONE`-terminated attribute list for `eglCreateImage`
pub fn attribute_list(
    format: DrmFourcc,
    geometry: Geometry,
    planes: &[ImportedPlane],
    color: Option<ColorHints>,
) -> Vec<i64> {
    let mut attribs = vec![
        EGL_WIDTH,
        geometry.width as i64,
        EGL_HEIGHT,
        geometry.height as i64,
        EGL_LINUX_DRM_FOURCC_EXT,
        format.0 as i64,
    ];

    for (plane, keys) in planes.iter().zip(EGL_DMA_BUF_PLANE_ATTRIBS.iter()) {
        attribs.extend_from_slice(&[
            keys[0],
            plane.fd as i64,
            keys[1],
            plane.offset as i64,
            keys[2],
            plane.pitch as i64,
        ]);
    }

    if let Some(hints) = color {
        let space = match hints.color_space {
            YuvColorSpace::Rec601 => EGL_ITU_REC601_EXT,
            YuvColorSpace::Rec709 => EGL_ITU_REC709_EXT,
            YuvColorSpace::Rec2020 => EGL_ITU_REC2020_EXT,
        };
        let range = match hints.range {
            SampleRange::Full => EGL_YUV_FULL_RANGE_EXT,
            SampleRange::Narrow => EGL_YUV_NARROW_RANGE_EXT,
        };
        attribs.extend_from_slice(&[
            EGL_YUV_COLOR_SPACE_HINT_EXT,
            space,
            EGL_SAMPLE_RANGE_HINT_EXT,
            range,
        ]);
    }

    attribs.push(EGL_NONE);
    attribs
}

/// Value following `key` in an attribute list
pub fn attribute_value(attribs: &[i64], key: i64) -> Option<i64> {
    attribs
        .chunks_exact(2)
        .take_while(|pair| pair[0] != EGL_NONE)
        .find(|pair| pair[0] == key)
        .map(|pair| pair[1])
}
