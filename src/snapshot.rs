// SPDX-License-Identifier: GPL-3.0-only

//! Writing output surfaces to image files
//!
//! DRM formats are little-endian packed: `RGBA8888` is stored A, B, G, R in
//! memory and `RGB888` as B, G, R. Rows are converted to straight RGB(A) or
//! luma before encoding.

use std::path::Path;

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use tracing::info;

use crate::errors::{PipelineError, PipelineResult};
use crate::gpu::DrmFourcc;
use crate::gpu::formats;

/// Convert a tightly packed output frame to an encodable image
pub fn to_image(bytes: &[u8], format: DrmFourcc, width: u32, height: u32) -> PipelineResult<DynamicImage> {
    let info = formats::lookup(format).ok_or(PipelineError::UnsupportedPixelFormat(format))?;
    let required = info.frame_size(width, height) as usize;
    if bytes.len() < required {
        return Err(PipelineError::BufferTooSmall {
            required: required as u64,
            actual: bytes.len(),
        });
    }
    let bytes = &bytes[..required];
    let too_small = || PipelineError::BufferTooSmall {
        required: required as u64,
        actual: bytes.len(),
    };

    let image = match format {
        DrmFourcc::R8 => DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, bytes.to_vec()).ok_or_else(too_small)?),
        DrmFourcc::RG88 => {
            let rgb = bytes.chunks_exact(2).flat_map(|px| [px[1], px[0], 0]).collect();
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, rgb).ok_or_else(too_small)?)
        }
        DrmFourcc::RGB888 => {
            let rgb = bytes.chunks_exact(3).flat_map(|px| [px[2], px[1], px[0]]).collect();
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, rgb).ok_or_else(too_small)?)
        }
        DrmFourcc::RGBA8888 => {
            let rgba = bytes
                .chunks_exact(4)
                .flat_map(|px| [px[3], px[2], px[1], px[0]])
                .collect();
            DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, rgba).ok_or_else(too_small)?)
        }
        other => return Err(PipelineError::UnsupportedPixelFormat(other)),
    };
    Ok(image)
}

/// Encode a frame to `path`; the file type follows the extension
pub fn save(bytes: &[u8], format: DrmFourcc, width: u32, height: u32, path: &Path) -> PipelineResult<()> {
    let image = to_image(bytes, format, width, height)?;
    image.save(path)?;
    info!(path = %path.display(), format = %format, "Saved output frame");
    Ok(())
}
