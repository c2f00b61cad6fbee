// SPDX-License-Identifier: GPL-3.0-only

//! GPU side of the zero-copy path
//!
//! Capture and output buffers are imported into the GPU driver as
//! `EGL_LINUX_DMA_BUF_EXT` images and bound either as framebuffer color
//! attachments or as external sampler textures. Every driver call goes
//! through [`GpuDriver`] so the import and bind logic can be exercised
//! without a GPU.

pub mod egl;
pub mod formats;
pub mod importer;
pub mod render_target;

use std::fmt;

pub use formats::DrmFourcc;
pub use importer::{Geometry, ImageImporter, ImportedImage};
pub use render_target::{RenderSurface, RenderTargetBinder, SampledTexture};

/// Error code reported by the driver (`eglGetError` / `glGetError`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverError(pub u32);

impl DriverError {
    pub fn code(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver error {:#06x}", self.0)
    }
}

impl std::error::Error for DriverError {}

/// Opaque driver-side image (`EGLImage`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuImage(pub usize);

/// GL texture name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuTexture(pub u32);

/// GL renderbuffer name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuRenderbuffer(pub u32);

/// GL framebuffer name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuFramebuffer(pub u32);

/// `GL_FRAMEBUFFER_COMPLETE`
pub const FRAMEBUFFER_COMPLETE: u32 = 0x8CD5;

/// Driver operations used by the importer and the render-target binder.
///
/// Creation calls return the driver's error code on refusal. Deletion calls
/// cannot fail from the caller's point of view.
pub trait GpuDriver {
    /// `eglCreateImage(EGL_LINUX_DMA_BUF_EXT)` with an `EGL_NONE`-terminated
    /// attribute list
    fn create_image(&mut self, attribs: &[i64]) -> Result<GpuImage, DriverError>;

    fn destroy_image(&mut self, image: GpuImage);

    fn create_renderbuffer(&mut self) -> Result<GpuRenderbuffer, DriverError>;

    /// Back the renderbuffer's storage with the image
    /// (`glEGLImageTargetRenderbufferStorageOES`)
    fn renderbuffer_storage_from_image(
        &mut self,
        renderbuffer: GpuRenderbuffer,
        image: GpuImage,
    ) -> Result<(), DriverError>;

    fn delete_renderbuffer(&mut self, renderbuffer: GpuRenderbuffer);

    fn create_framebuffer(&mut self) -> Result<GpuFramebuffer, DriverError>;

    /// Attach as `GL_COLOR_ATTACHMENT0`
    fn attach_color(
        &mut self,
        framebuffer: GpuFramebuffer,
        renderbuffer: GpuRenderbuffer,
    ) -> Result<(), DriverError>;

    fn framebuffer_status(&mut self, framebuffer: GpuFramebuffer) -> u32;

    fn delete_framebuffer(&mut self, framebuffer: GpuFramebuffer);

    fn create_texture(&mut self) -> Result<GpuTexture, DriverError>;

    /// Bind as `GL_TEXTURE_EXTERNAL_OES` backed by the image
    /// (`glEGLImageTargetTexture2DOES`)
    fn texture_from_image(&mut self, texture: GpuTexture, image: GpuImage) -> Result<(), DriverError>;

    fn delete_texture(&mut self, texture: GpuTexture);

    /// Wait for all submitted GPU work (`glFinish`)
    fn finish(&mut self);
}
