//! GLX interface for the NVIDIA path
//!
//! NVIDIA's EGL lacks the pixmap-as-texture extension while its GLX carries
//! `GLX_EXT_texture_from_pixmap`, so the NVENC pairing runs on GLX. The
//! standard entry points come from `x11-dl`; the texture-from-pixmap pair is
//! resolved through `glXGetProcAddress`.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_int, c_ulong};
use std::ptr;

use thiserror::Error;
use tracing::info;
use x11_dl::glx::{self, Glx};
use x11_dl::xlib;

use super::x11::X11Display;

// GLX_EXT_texture_from_pixmap tokens, absent from the core bindings.
const GLX_BIND_TO_TEXTURE_RGBA_EXT: c_int = 0x20D1;
const GLX_BIND_TO_TEXTURE_TARGETS_EXT: c_int = 0x20D3;
const GLX_Y_INVERTED_EXT: c_int = 0x20D4;
const GLX_TEXTURE_FORMAT_EXT: c_int = 0x20D5;
const GLX_TEXTURE_TARGET_EXT: c_int = 0x20D6;
const GLX_TEXTURE_FORMAT_RGBA_EXT: c_int = 0x20DA;
const GLX_TEXTURE_2D_EXT: c_int = 0x20DC;
const GLX_TEXTURE_2D_BIT_EXT: c_int = 0x0002;
const GLX_FRONT_EXT: c_int = 0x20DE;

#[derive(Debug, Error)]
pub enum GlxError {
    #[error("libGL unavailable: {0}")]
    Load(String),

    #[error("GLX version {major}.{minor} too old")]
    TooOld { major: i32, minor: i32 },

    #[error("missing GLX extension {name}")]
    MissingExtension { name: &'static str },

    #[error("{function} failed")]
    Call { function: &'static str },
}

type FnBindTexImageExt =
    unsafe extern "C" fn(*mut xlib::Display, glx::GLXDrawable, c_int, *const c_int);
type FnReleaseTexImageExt =
    unsafe extern "C" fn(*mut xlib::Display, glx::GLXDrawable, c_int);

/// GLX context plus the pixmap FB config used for texture binding.
pub struct GlxInterface {
    glx: Glx,
    display: *mut xlib::Display,
    context: glx::GLXContext,
    pixmap_config: glx::GLXFBConfig,
    bind_tex_image_ext: FnBindTexImageExt,
    release_tex_image_ext: FnReleaseTexImageExt,
}

impl GlxInterface {
    pub fn init(x11: &X11Display) -> Result<Self, GlxError> {
        let glx = Glx::open().map_err(|e| GlxError::Load(e.to_string()))?;
        let display = x11.raw();
        let screen = x11.screen();
        let xfree = x11.xfree();

        // SAFETY: display is a live Xlib connection for the whole block; the
        // attribute lists are NULL-terminated; config arrays are freed with
        // XFree after the first entry is copied out.
        unsafe {
            let mut major = 0;
            let mut minor = 0;
            if (glx.glXQueryVersion)(display, &mut major, &mut minor) == 0 {
                return Err(GlxError::Call { function: "glXQueryVersion" });
            }
            info!(major, minor, "GLX initialised");
            if major * 10 + minor < 11 {
                return Err(GlxError::TooOld { major, minor });
            }

            let ext_raw = (glx.glXQueryExtensionsString)(display, screen);
            let extensions = if ext_raw.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ext_raw).to_string_lossy().into_owned()
            };
            if !extensions.split(' ').any(|e| e == "GLX_EXT_texture_from_pixmap") {
                return Err(GlxError::MissingExtension {
                    name: "GLX_EXT_texture_from_pixmap",
                });
            }

            let window_attrs: [c_int; 13] = [
                glx::GLX_DRAWABLE_TYPE,
                glx::GLX_WINDOW_BIT,
                glx::GLX_RENDER_TYPE,
                glx::GLX_RGBA_BIT,
                glx::GLX_DOUBLEBUFFER,
                1,
                glx::GLX_RED_SIZE,
                8,
                glx::GLX_GREEN_SIZE,
                8,
                glx::GLX_BLUE_SIZE,
                8,
                0,
            ];
            let mut n_configs = 0;
            let window_configs =
                (glx.glXChooseFBConfig)(display, screen, window_attrs.as_ptr(), &mut n_configs);
            if window_configs.is_null() || n_configs < 1 {
                return Err(GlxError::Call { function: "glXChooseFBConfig" });
            }
            let window_config = *window_configs;
            xfree(window_configs as *mut c_void);

            let context = (glx.glXCreateNewContext)(
                display,
                window_config,
                glx::GLX_RGBA_TYPE,
                ptr::null_mut(),
                1,
            );
            if context.is_null() {
                return Err(GlxError::Call { function: "glXCreateNewContext" });
            }
            if (glx.glXMakeCurrent)(display, x11.root(), context) == 0 {
                return Err(GlxError::Call { function: "glXMakeCurrent" });
            }

            let pixmap_attrs: [c_int; 11] = [
                GLX_BIND_TO_TEXTURE_RGBA_EXT,
                1,
                glx::GLX_DRAWABLE_TYPE,
                glx::GLX_PIXMAP_BIT,
                GLX_BIND_TO_TEXTURE_TARGETS_EXT,
                GLX_TEXTURE_2D_BIT_EXT,
                glx::GLX_DOUBLEBUFFER,
                0,
                GLX_Y_INVERTED_EXT,
                1,
                0,
            ];
            let mut n_pixmap_configs = 0;
            let pixmap_configs = (glx.glXChooseFBConfig)(
                display,
                screen,
                pixmap_attrs.as_ptr(),
                &mut n_pixmap_configs,
            );
            if pixmap_configs.is_null() || n_pixmap_configs < 1 {
                return Err(GlxError::Call { function: "glXChooseFBConfig" });
            }
            let pixmap_config = *pixmap_configs;
            xfree(pixmap_configs as *mut c_void);

            let bind_tex_image_ext: FnBindTexImageExt =
                Self::proc_address(&glx, "glXBindTexImageEXT")?;
            let release_tex_image_ext: FnReleaseTexImageExt =
                Self::proc_address(&glx, "glXReleaseTexImageEXT")?;

            Ok(Self {
                glx,
                display,
                context,
                pixmap_config,
                bind_tex_image_ext,
                release_tex_image_ext,
            })
        }
    }

    /// SAFETY: `F` must match the actual prototype of `name`.
    unsafe fn proc_address<F>(glx: &Glx, name: &'static str) -> Result<F, GlxError> {
        let cname = CString::new(name).map_err(|_| GlxError::Call { function: "CString" })?;
        // SAFETY: cname outlives the call.
        let ptr = unsafe { (glx.glXGetProcAddress)(cname.as_ptr() as *const u8) };
        match ptr {
            // SAFETY: non-null GLX proc address of the requested name; the
            // caller guarantees the prototype.
            Some(f) => {
                debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of_val(&f));
                Ok(unsafe { std::mem::transmute_copy(&f) })
            }
            None => Err(GlxError::Load(format!("{name} not exported"))),
        }
    }

    pub fn get_proc_address(&self, name: &str) -> *const c_void {
        let Ok(cname) = CString::new(name) else {
            return ptr::null();
        };
        // SAFETY: cname outlives the call.
        match unsafe { (self.glx.glXGetProcAddress)(cname.as_ptr() as *const u8) } {
            Some(f) => f as *const c_void,
            None => ptr::null(),
        }
    }

    /// Wrap an X pixmap into a GLX pixmap bindable as a 2D texture.
    pub fn create_image(&self, pixmap: c_ulong) -> Result<glx::GLXPixmap, GlxError> {
        let attrs: [c_int; 5] = [
            GLX_TEXTURE_TARGET_EXT,
            GLX_TEXTURE_2D_EXT,
            GLX_TEXTURE_FORMAT_EXT,
            GLX_TEXTURE_FORMAT_RGBA_EXT,
            0,
        ];
        // SAFETY: display/config are live; the pixmap id comes from Xlib.
        let glx_pixmap = unsafe {
            (self.glx.glXCreatePixmap)(self.display, self.pixmap_config, pixmap, attrs.as_ptr())
        };
        if glx_pixmap == 0 {
            return Err(GlxError::Call { function: "glXCreatePixmap" });
        }
        Ok(glx_pixmap)
    }

    pub fn destroy_image(&self, glx_pixmap: glx::GLXPixmap) {
        // SAFETY: glx_pixmap came from create_image.
        unsafe {
            (self.glx.glXDestroyPixmap)(self.display, glx_pixmap);
        }
    }

    pub fn bind_tex_image(&self, glx_pixmap: glx::GLXPixmap) {
        // SAFETY: glx_pixmap is live; binds the front buffer to the bound texture.
        unsafe {
            (self.bind_tex_image_ext)(self.display, glx_pixmap, GLX_FRONT_EXT, ptr::null());
        }
    }

    pub fn release_tex_image(&self, glx_pixmap: glx::GLXPixmap) {
        // SAFETY: glx_pixmap is live.
        unsafe {
            (self.release_tex_image_ext)(self.display, glx_pixmap, GLX_FRONT_EXT);
        }
    }
}

impl Drop for GlxInterface {
    fn drop(&mut self) {
        // SAFETY: context belongs to this display; unbind before destroying.
        unsafe {
            (self.glx.glXMakeCurrent)(self.display, 0, ptr::null_mut());
            (self.glx.glXDestroyContext)(self.display, self.context);
        }
    }
}
