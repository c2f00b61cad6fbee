// SPDX-License-Identifier: GPL-3.0-only

//! Binding imported images as render targets or sampler textures

use tracing::debug;

use super::importer::ImportedImage;
use super::{FRAMEBUFFER_COMPLETE, GpuDriver, GpuFramebuffer, GpuRenderbuffer, GpuTexture};
use crate::errors::{PipelineError, PipelineResult};

/// Framebuffer whose color attachment is backed by an imported image
#[derive(Debug, PartialEq, Eq)]
pub struct RenderSurface {
    pub framebuffer: GpuFramebuffer,
    pub renderbuffer: GpuRenderbuffer,
    pub width: u32,
    pub height: u32,
}

/// External-OES texture backed by an imported image
#[derive(Debug, PartialEq, Eq)]
pub struct SampledTexture {
    pub texture: GpuTexture,
}

/// Creates and destroys the GL objects around imported images
#[derive(Debug, Default, Clone, Copy)]
pub struct RenderTargetBinder;

impl RenderTargetBinder {
    pub fn new() -> Self {
        Self
    }

    /// Renderbuffer + framebuffer with `image` as color attachment 0.
    ///
    /// Objects created before a failure are deleted again.
    pub fn bind<G: GpuDriver + ?Sized>(&self, driver: &mut G, image: &ImportedImage) -> PipelineResult<RenderSurface> {
        let renderbuffer = driver
            .create_renderbuffer()
            .map_err(|e| PipelineError::AttachmentFailed {
                stage: "glGenRenderbuffers",
                code: e.code(),
            })?;

        if let Err(e) = driver.renderbuffer_storage_from_image(renderbuffer, image.image) {
            driver.delete_renderbuffer(renderbuffer);
            return Err(PipelineError::AttachmentFailed {
                stage: "glEGLImageTargetRenderbufferStorageOES",
                code: e.code(),
            });
        }

        let framebuffer = match driver.create_framebuffer() {
            Ok(fb) => fb,
            Err(e) => {
                driver.delete_renderbuffer(renderbuffer);
                return Err(PipelineError::AttachmentFailed {
                    stage: "glGenFramebuffers",
                    code: e.code(),
                });
            }
        };

        if let Err(e) = driver.attach_color(framebuffer, renderbuffer) {
            driver.delete_framebuffer(framebuffer);
            driver.delete_renderbuffer(renderbuffer);
            return Err(PipelineError::AttachmentFailed {
                stage: "glFramebufferRenderbuffer",
                code: e.code(),
            });
        }

        let status = driver.framebuffer_status(framebuffer);
        if status != FRAMEBUFFER_COMPLETE {
            driver.delete_framebuffer(framebuffer);
            driver.delete_renderbuffer(renderbuffer);
            return Err(PipelineError::FramebufferIncomplete { status });
        }

        debug!(
            buffer = %image.buffer,
            framebuffer = framebuffer.0,
            renderbuffer = renderbuffer.0,
            "Bound render surface"
        );

        Ok(RenderSurface {
            framebuffer,
            renderbuffer,
            width: image.width,
            height: image.height,
        })
    }

    /// External sampler texture over `image`
    pub fn bind_sampler<G: GpuDriver + ?Sized>(
        &self,
        driver: &mut G,
        image: &ImportedImage,
    ) -> PipelineResult<SampledTexture> {
        let texture = driver.create_texture().map_err(|e| PipelineError::AttachmentFailed {
            stage: "glGenTextures",
            code: e.code(),
        })?;

        if let Err(e) = driver.texture_from_image(texture, image.image) {
            driver.delete_texture(texture);
            return Err(PipelineError::AttachmentFailed {
                stage: "glEGLImageTargetTexture2DOES",
                code: e.code(),
            });
        }

        debug!(buffer = %image.buffer, texture = texture.0, "Bound sampler texture");
        Ok(SampledTexture { texture })
    }

    pub fn release<G: GpuDriver + ?Sized>(&self, driver: &mut G, surface: RenderSurface) {
        driver.delete_framebuffer(surface.framebuffer);
        driver.delete_renderbuffer(surface.renderbuffer);
    }

    pub fn release_sampler<G: GpuDriver + ?Sized>(&self, driver: &mut G, sampler: SampledTexture) {
        driver.delete_texture(sampler.texture);
    }
}
