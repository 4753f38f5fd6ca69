//! GL interface selection
//!
//! Two ways to get a pixmap into a sampler and a context current, one per
//! vendor stack. The pairing with the encoder backend is fixed: EGL carries
//! the DMA-BUF encoder, GLX carries the texture-input encoder; no other
//! combination constructs.

use std::ffi::c_void;
use std::os::raw::c_ulong;

use super::egl::{EglError, EglInterface};
use super::glx::{GlxError, GlxInterface};
use super::GpuError;

/// Backend-opaque handle for an imported pixmap (EGL surface or GLX pixmap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlImage(pub(crate) usize);

/// The selected windowing-system interface.
pub enum GlInterface {
    Egl(EglInterface),
    Glx(GlxInterface),
}

impl GlInterface {
    pub fn name(&self) -> &'static str {
        match self {
            GlInterface::Egl(_) => "egl",
            GlInterface::Glx(_) => "glx",
        }
    }

    /// The EGL half, present only on the DMA-BUF pairing.
    pub fn egl(&self) -> Option<&EglInterface> {
        match self {
            GlInterface::Egl(egl) => Some(egl),
            GlInterface::Glx(_) => None,
        }
    }

    pub fn get_proc_address(&self, name: &str) -> *const c_void {
        match self {
            GlInterface::Egl(egl) => egl.get_proc_address(name),
            GlInterface::Glx(glx) => glx.get_proc_address(name),
        }
    }

    pub fn create_image(&self, pixmap: c_ulong) -> Result<GlImage, GpuError> {
        match self {
            GlInterface::Egl(egl) => Ok(GlImage(egl.create_image(pixmap)? as usize)),
            GlInterface::Glx(glx) => Ok(GlImage(glx.create_image(pixmap)? as usize)),
        }
    }

    pub fn destroy_image(&self, image: GlImage) {
        match self {
            GlInterface::Egl(egl) => egl.destroy_image(image.0 as *mut c_void),
            GlInterface::Glx(glx) => glx.destroy_image(image.0 as c_ulong),
        }
    }

    /// Bind the imported pixmap to the currently bound 2D texture.
    ///
    /// The binding must be released before control returns to the event
    /// loop so the display server may write the pixmap again.
    pub fn bind_tex_image(&self, image: GlImage) {
        match self {
            GlInterface::Egl(egl) => egl.bind_tex_image(image.0 as *mut c_void),
            GlInterface::Glx(glx) => glx.bind_tex_image(image.0 as c_ulong),
        }
    }

    pub fn release_tex_image(&self, image: GlImage) {
        match self {
            GlInterface::Egl(egl) => egl.release_tex_image(image.0 as *mut c_void),
            GlInterface::Glx(glx) => glx.release_tex_image(image.0 as c_ulong),
        }
    }
}

impl From<EglError> for GpuError {
    fn from(e: EglError) -> Self {
        GpuError::Egl(e)
    }
}

impl From<GlxError> for GpuError {
    fn from(e: GlxError) -> Self {
        GpuError::Glx(e)
    }
}
