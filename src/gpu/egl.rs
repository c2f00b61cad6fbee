// SPDX-License-Identifier: GPL-3.0-only

//! EGL + OpenGL ES implementation of [`GpuDriver`]
//!
//! The display is brought up headless: default display, a 1x1 pbuffer and a
//! GLES 2 context made current on the calling thread. dma-buf import needs
//! `EGL_EXT_image_dma_buf_import`; binding needs `GL_OES_EGL_image` and
//! `GL_OES_EGL_image_external`.

use std::ffi::c_void;
use std::num::NonZeroU32;

use glow::HasContext;
use khronos_egl as egl;
use tracing::{debug, info, warn};

use super::importer::EGL_LINUX_DMA_BUF_EXT;
use super::render_target::RenderSurface;
use super::{DriverError, GpuDriver, GpuFramebuffer, GpuImage, GpuRenderbuffer, GpuTexture};
use crate::errors::{PipelineError, PipelineResult};

const GL_TEXTURE_EXTERNAL_OES: u32 = 0x8D65;
const DMA_BUF_IMPORT_EXTENSION: &str = "EGL_EXT_image_dma_buf_import";

type EglInstance = egl::DynamicInstance<egl::EGL1_5>;

/// `glEGLImageTargetTexture2DOES` / `glEGLImageTargetRenderbufferStorageOES`
type ImageTargetFn = unsafe extern "system" fn(target: u32, image: *const c_void);

pub struct EglGles {
    egl: EglInstance,
    display: egl::Display,
    surface: egl::Surface,
    context: egl::Context,
    gl: glow::Context,
    image_target_texture: ImageTargetFn,
    image_target_renderbuffer: ImageTargetFn,
}

impl EglGles {
    /// Initialise EGL on the default display with a pbuffer-backed GLES 2
    /// context current on this thread
    pub fn headless() -> PipelineResult<Self> {
        let egl = unsafe { EglInstance::load_required() }
            .map_err(|e| PipelineError::GpuUnavailable(format!("failed to load libEGL: {}", e)))?;

        let display = unsafe { egl.get_display(egl::DEFAULT_DISPLAY) }
            .ok_or_else(|| PipelineError::GpuUnavailable("no default EGL display".into()))?;
        let (major, minor) = egl
            .initialize(display)
            .map_err(|e| PipelineError::GpuUnavailable(format!("eglInitialize: {}", e)))?;

        let extensions = egl
            .query_string(Some(display), egl::EXTENSIONS)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !extensions.split_whitespace().any(|ext| ext == DMA_BUF_IMPORT_EXTENSION) {
            let _ = egl.terminate(display);
            return Err(PipelineError::GpuUnavailable(format!(
                "{} not supported by the EGL display",
                DMA_BUF_IMPORT_EXTENSION
            )));
        }

        match Self::create_context(&egl, display) {
            Ok((surface, context, gl, image_target_texture, image_target_renderbuffer)) => {
                info!(
                    egl = format!("{}.{}", major, minor),
                    renderer = %unsafe { gl.get_parameter_string(glow::RENDERER) },
                    "EGL context ready"
                );
                Ok(Self {
                    egl,
                    display,
                    surface,
                    context,
                    gl,
                    image_target_texture,
                    image_target_renderbuffer,
                })
            }
            Err(e) => {
                let _ = egl.terminate(display);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn create_context(
        egl: &EglInstance,
        display: egl::Display,
    ) -> PipelineResult<(egl::Surface, egl::Context, glow::Context, ImageTargetFn, ImageTargetFn)> {
        let unavailable = |what: &str, e: egl::Error| PipelineError::GpuUnavailable(format!("{}: {}", what, e));

        egl.bind_api(egl::OPENGL_ES_API)
            .map_err(|e| unavailable("eglBindAPI", e))?;

        let config_attribs = [
            egl::SURFACE_TYPE,
            egl::PBUFFER_BIT,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES2_BIT,
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::ALPHA_SIZE,
            8,
            egl::NONE,
        ];
        let config = egl
            .choose_first_config(display, &config_attribs)
            .map_err(|e| unavailable("eglChooseConfig", e))?
            .ok_or_else(|| PipelineError::GpuUnavailable("no pbuffer-capable GLES2 config".into()))?;

        let surface = egl
            .create_pbuffer_surface(display, config, &[egl::WIDTH, 1, egl::HEIGHT, 1, egl::NONE])
            .map_err(|e| unavailable("eglCreatePbufferSurface", e))?;

        let context = match egl.create_context(display, config, None, &[egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE]) {
            Ok(context) => context,
            Err(e) => {
                let _ = egl.destroy_surface(display, surface);
                return Err(unavailable("eglCreateContext", e));
            }
        };

        let release = |e: PipelineError| {
            let _ = egl.make_current(display, None, None, None);
            let _ = egl.destroy_context(display, context);
            let _ = egl.destroy_surface(display, surface);
            e
        };

        egl.make_current(display, Some(surface), Some(surface), Some(context))
            .map_err(|e| release(unavailable("eglMakeCurrent", e)))?;

        let gl = unsafe {
            glow::Context::from_loader_function(|name| {
                egl.get_proc_address(name)
                    .map_or(std::ptr::null(), |f| f as *const c_void)
            })
        };

        let load = |name: &str| -> PipelineResult<ImageTargetFn> {
            let f = egl
                .get_proc_address(name)
                .ok_or_else(|| PipelineError::GpuUnavailable(format!("{} not available", name)))?;
            // SAFETY: the GLES entry point has this exact C signature
            Ok(unsafe { std::mem::transmute::<extern "system" fn(), ImageTargetFn>(f) })
        };
        let image_target_texture = load("glEGLImageTargetTexture2DOES").map_err(&release)?;
        let image_target_renderbuffer = load("glEGLImageTargetRenderbufferStorageOES").map_err(&release)?;

        Ok((surface, context, gl, image_target_texture, image_target_renderbuffer))
    }

    pub fn gl(&self) -> &glow::Context {
        &self.gl
    }

    /// Bind a render surface as the draw target and set the viewport to it
    pub fn bind_surface(&self, surface: &RenderSurface) {
        unsafe {
            self.gl
                .bind_framebuffer(glow::FRAMEBUFFER, to_native(surface.framebuffer.0).map(glow::NativeFramebuffer));
            self.gl.viewport(0, 0, surface.width as i32, surface.height as i32);
        }
    }

    /// Fill a render surface with one color
    pub fn clear_surface(&self, surface: &RenderSurface, rgba: [f32; 4]) {
        self.bind_surface(surface);
        unsafe {
            self.gl.clear_color(rgba[0], rgba[1], rgba[2], rgba[3]);
            self.gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }

    fn gl_error(&self) -> Option<DriverError> {
        let code = unsafe { self.gl.get_error() };
        (code != glow::NO_ERROR).then_some(DriverError(code))
    }
}

fn to_native(name: u32) -> Option<NonZeroU32> {
    NonZeroU32::new(name)
}

impl GpuDriver for EglGles {
    fn create_image(&mut self, attribs: &[i64]) -> Result<GpuImage, DriverError> {
        let attrib_list: Vec<egl::Attrib> = attribs.iter().map(|&a| a as egl::Attrib).collect();
        // SAFETY: EGL_LINUX_DMA_BUF_EXT takes no context and a null client buffer
        let (context, buffer) = unsafe {
            (
                egl::Context::from_ptr(egl::NO_CONTEXT),
                egl::ClientBuffer::from_ptr(std::ptr::null_mut()),
            )
        };
        self.egl
            .create_image(self.display, context, EGL_LINUX_DMA_BUF_EXT, buffer, &attrib_list)
            .map(|image| GpuImage(image.as_ptr() as usize))
            .map_err(|e| DriverError(e.native() as u32))
    }

    fn destroy_image(&mut self, image: GpuImage) {
        let handle = unsafe { egl::Image::from_ptr(image.0 as egl::EGLImage) };
        if let Err(e) = self.egl.destroy_image(self.display, handle) {
            warn!(error = %e, "eglDestroyImage failed");
        }
    }

    fn create_renderbuffer(&mut self) -> Result<GpuRenderbuffer, DriverError> {
        unsafe { self.gl.create_renderbuffer() }
            .map(|rb| GpuRenderbuffer(rb.0.get()))
            .map_err(|_| self.gl_error().unwrap_or(DriverError(0)))
    }

    fn renderbuffer_storage_from_image(
        &mut self,
        renderbuffer: GpuRenderbuffer,
        image: GpuImage,
    ) -> Result<(), DriverError> {
        unsafe {
            self.gl
                .bind_renderbuffer(glow::RENDERBUFFER, to_native(renderbuffer.0).map(glow::NativeRenderbuffer));
            (self.image_target_renderbuffer)(glow::RENDERBUFFER, image.0 as *const c_void);
        }
        match self.gl_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn delete_renderbuffer(&mut self, renderbuffer: GpuRenderbuffer) {
        if let Some(name) = to_native(renderbuffer.0) {
            unsafe { self.gl.delete_renderbuffer(glow::NativeRenderbuffer(name)) };
        }
    }

    fn create_framebuffer(&mut self) -> Result<GpuFramebuffer, DriverError> {
        unsafe { self.gl.create_framebuffer() }
            .map(|fb| GpuFramebuffer(fb.0.get()))
            .map_err(|_| self.gl_error().unwrap_or(DriverError(0)))
    }

    fn attach_color(
        &mut self,
        framebuffer: GpuFramebuffer,
        renderbuffer: GpuRenderbuffer,
    ) -> Result<(), DriverError> {
        unsafe {
            self.gl
                .bind_framebuffer(glow::FRAMEBUFFER, to_native(framebuffer.0).map(glow::NativeFramebuffer));
            self.gl.framebuffer_renderbuffer(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::RENDERBUFFER,
                to_native(renderbuffer.0).map(glow::NativeRenderbuffer),
            );
        }
        match self.gl_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn framebuffer_status(&mut self, framebuffer: GpuFramebuffer) -> u32 {
        unsafe {
            self.gl
                .bind_framebuffer(glow::FRAMEBUFFER, to_native(framebuffer.0).map(glow::NativeFramebuffer));
            self.gl.check_framebuffer_status(glow::FRAMEBUFFER)
        }
    }

    fn delete_framebuffer(&mut self, framebuffer: GpuFramebuffer) {
        if let Some(name) = to_native(framebuffer.0) {
            unsafe { self.gl.delete_framebuffer(glow::NativeFramebuffer(name)) };
        }
    }

    fn create_texture(&mut self) -> Result<GpuTexture, DriverError> {
        unsafe { self.gl.create_texture() }
            .map(|tex| GpuTexture(tex.0.get()))
            .map_err(|_| self.gl_error().unwrap_or(DriverError(0)))
    }

    fn texture_from_image(&mut self, texture: GpuTexture, image: GpuImage) -> Result<(), DriverError> {
        unsafe {
            self.gl
                .bind_texture(GL_TEXTURE_EXTERNAL_OES, to_native(texture.0).map(glow::NativeTexture));
            self.gl
                .tex_parameter_i32(GL_TEXTURE_EXTERNAL_OES, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            self.gl
                .tex_parameter_i32(GL_TEXTURE_EXTERNAL_OES, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            (self.image_target_texture)(GL_TEXTURE_EXTERNAL_OES, image.0 as *const c_void);
        }
        match self.gl_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn delete_texture(&mut self, texture: GpuTexture) {
        if let Some(name) = to_native(texture.0) {
            unsafe { self.gl.delete_texture(glow::NativeTexture(name)) };
        }
    }

    fn finish(&mut self) {
        unsafe { self.gl.finish() };
    }
}

impl Drop for EglGles {
    fn drop(&mut self) {
        debug!("Tearing down EGL context");
        let _ = self.egl.make_current(self.display, None, None, None);
        if let Err(e) = self.egl.destroy_context(self.display, self.context) {
            warn!(error = %e, "eglDestroyContext failed");
        }
        if let Err(e) = self.egl.destroy_surface(self.display, self.surface) {
            warn!(error = %e, "eglDestroySurface failed");
        }
        if let Err(e) = self.egl.terminate(self.display) {
            warn!(error = %e, "eglTerminate failed");
        }
    }
}
