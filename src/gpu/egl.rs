//! EGL interface for the Mesa path
//!
//! Mesa's EGL carries both halves of the vendor B pipeline: pixmap-backed
//! source textures (`EGL_NOK_texture_from_pixmap`) and DMA-BUF export of the
//! encode texture (`EGL_MESA_image_dma_buf_export` on top of
//! `EGL_KHR_image_base`). libEGL is opened with `libloading` and the handful
//! of entry points the helper uses are resolved by hand; extension entry
//! points come from `eglGetProcAddress`.

use std::ffi::{c_void, CStr, CString};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::raw::{c_char, c_int, c_uint, c_ulong};
use std::ptr;

use libloading::Library;
use thiserror::Error;
use tracing::info;

use super::x11::X11Display;

pub type EglDisplay = *mut c_void;
pub type EglConfig = *mut c_void;
pub type EglContext = *mut c_void;
pub type EglSurface = *mut c_void;
pub type EglImage = *mut c_void;
type EglBoolean = c_uint;
type EglInt = c_int;

const EGL_FALSE: EglBoolean = 0;

const EGL_OPENGL_API: c_uint = 0x30A2;
const EGL_BLUE_SIZE: EglInt = 0x3022;
const EGL_GREEN_SIZE: EglInt = 0x3023;
const EGL_RED_SIZE: EglInt = 0x3024;
const EGL_NONE: EglInt = 0x3038;
const EGL_EXTENSIONS: EglInt = 0x3055;
const EGL_TEXTURE_RGBA: EglInt = 0x305E;
const EGL_TEXTURE_2D: EglInt = 0x305F;
const EGL_TEXTURE_FORMAT: EglInt = 0x3080;
const EGL_TEXTURE_TARGET: EglInt = 0x3081;
const EGL_BACK_BUFFER: EglInt = 0x3084;
const EGL_CONTEXT_MAJOR_VERSION: EglInt = 0x3098;
const EGL_CONTEXT_MINOR_VERSION: EglInt = 0x30FB;
const EGL_GL_TEXTURE_2D_KHR: c_uint = 0x30B1;

const REQUIRED_EXTENSIONS: [&str; 3] = [
    "EGL_NOK_texture_from_pixmap",
    "EGL_MESA_image_dma_buf_export",
    "EGL_KHR_image_base",
];

#[derive(Debug, Error)]
pub enum EglError {
    #[error("libEGL unavailable: {0}")]
    Load(String),

    #[error("{function} failed")]
    Call { function: &'static str },

    #[error("EGL version {major}.{minor} too old")]
    TooOld { major: i32, minor: i32 },

    #[error("missing EGL extension {name}")]
    MissingExtension { name: &'static str },

    #[error("DMA-BUF export returned {num_planes} planes, expected 1")]
    ExportPlanes { num_planes: i32 },
}

type FnGetDisplay = unsafe extern "C" fn(*mut c_void) -> EglDisplay;
type FnInitialize = unsafe extern "C" fn(EglDisplay, *mut EglInt, *mut EglInt) -> EglBoolean;
type FnTerminate = unsafe extern "C" fn(EglDisplay) -> EglBoolean;
type FnBindApi = unsafe extern "C" fn(c_uint) -> EglBoolean;
type FnQueryString = unsafe extern "C" fn(EglDisplay, EglInt) -> *const c_char;
type FnChooseConfig =
    unsafe extern "C" fn(EglDisplay, *const EglInt, *mut EglConfig, EglInt, *mut EglInt) -> EglBoolean;
type FnCreateWindowSurface =
    unsafe extern "C" fn(EglDisplay, EglConfig, c_ulong, *const EglInt) -> EglSurface;
type FnCreatePixmapSurface =
    unsafe extern "C" fn(EglDisplay, EglConfig, c_ulong, *const EglInt) -> EglSurface;
type FnDestroySurface = unsafe extern "C" fn(EglDisplay, EglSurface) -> EglBoolean;
type FnCreateContext =
    unsafe extern "C" fn(EglDisplay, EglConfig, EglContext, *const EglInt) -> EglContext;
type FnMakeCurrent =
    unsafe extern "C" fn(EglDisplay, EglSurface, EglSurface, EglContext) -> EglBoolean;
type FnBindTexImage = unsafe extern "C" fn(EglDisplay, EglSurface, EglInt) -> EglBoolean;
type FnReleaseTexImage = unsafe extern "C" fn(EglDisplay, EglSurface, EglInt) -> EglBoolean;
type FnGetProcAddress = unsafe extern "C" fn(*const c_char) -> *const c_void;

type FnCreateImageKhr =
    unsafe extern "C" fn(EglDisplay, EglContext, c_uint, *mut c_void, *const EglInt) -> EglImage;
type FnDestroyImageKhr = unsafe extern "C" fn(EglDisplay, EglImage) -> EglBoolean;
type FnExportDmabufQueryMesa =
    unsafe extern "C" fn(EglDisplay, EglImage, *mut c_int, *mut c_int, *mut u64) -> EglBoolean;
type FnExportDmabufMesa =
    unsafe extern "C" fn(EglDisplay, EglImage, *mut c_int, *mut EglInt, *mut EglInt) -> EglBoolean;

/// EGL display/context pair plus the resolved entry points.
pub struct EglInterface {
    _lib: Library,
    display: EglDisplay,
    config: EglConfig,
    context: EglContext,
    // kept current for the life of the process
    _surface: EglSurface,

    destroy_surface: FnDestroySurface,
    create_pixmap_surface: FnCreatePixmapSurface,
    bind_tex_image: FnBindTexImage,
    release_tex_image: FnReleaseTexImage,
    get_proc_address: FnGetProcAddress,

    create_image_khr: FnCreateImageKhr,
    destroy_image_khr: FnDestroyImageKhr,
    export_query_mesa: FnExportDmabufQueryMesa,
    export_mesa: FnExportDmabufMesa,
}

macro_rules! egl_fn {
    ($lib:expr, $ty:ty, $name:literal) => {{
        // SAFETY: the declared type matches the EGL prototype of $name.
        let sym = unsafe { $lib.get::<$ty>(concat!($name, "\0").as_bytes()) }
            .map_err(|e| EglError::Load(e.to_string()))?;
        *sym
    }};
}

impl EglInterface {
    pub fn init(x11: &X11Display) -> Result<Self, EglError> {
        let lib = ["libEGL.so.1", "libEGL.so"]
            .iter()
            .find_map(|name| unsafe { Library::new(name) }.ok())
            .ok_or_else(|| EglError::Load("libEGL.so not found".into()))?;

        let get_display = egl_fn!(lib, FnGetDisplay, "eglGetDisplay");
        let initialize = egl_fn!(lib, FnInitialize, "eglInitialize");
        let terminate = egl_fn!(lib, FnTerminate, "eglTerminate");
        let bind_api = egl_fn!(lib, FnBindApi, "eglBindAPI");
        let query_string = egl_fn!(lib, FnQueryString, "eglQueryString");
        let choose_config = egl_fn!(lib, FnChooseConfig, "eglChooseConfig");
        let create_window_surface = egl_fn!(lib, FnCreateWindowSurface, "eglCreateWindowSurface");
        let create_pixmap_surface = egl_fn!(lib, FnCreatePixmapSurface, "eglCreatePixmapSurface");
        let destroy_surface = egl_fn!(lib, FnDestroySurface, "eglDestroySurface");
        let create_context = egl_fn!(lib, FnCreateContext, "eglCreateContext");
        let make_current = egl_fn!(lib, FnMakeCurrent, "eglMakeCurrent");
        let bind_tex_image = egl_fn!(lib, FnBindTexImage, "eglBindTexImage");
        let release_tex_image = egl_fn!(lib, FnReleaseTexImage, "eglReleaseTexImage");
        let get_proc_address = egl_fn!(lib, FnGetProcAddress, "eglGetProcAddress");

        // SAFETY: all entry points were resolved from the live library; the
        // X display pointer stays valid for the life of the context.
        unsafe {
            if bind_api(EGL_OPENGL_API) == EGL_FALSE {
                return Err(EglError::Call { function: "eglBindAPI" });
            }
            let display = get_display(x11.raw() as *mut c_void);
            if display.is_null() {
                return Err(EglError::Call { function: "eglGetDisplay" });
            }
            let mut major = 0;
            let mut minor = 0;
            if initialize(display, &mut major, &mut minor) == EGL_FALSE {
                return Err(EglError::Call { function: "eglInitialize" });
            }
            info!(major, minor, "EGL initialised");
            if major * 10 + minor < 11 {
                terminate(display);
                return Err(EglError::TooOld { major, minor });
            }

            let extensions = {
                let raw = query_string(display, EGL_EXTENSIONS);
                if raw.is_null() {
                    String::new()
                } else {
                    CStr::from_ptr(raw).to_string_lossy().into_owned()
                }
            };
            for name in REQUIRED_EXTENSIONS {
                if !extensions.split(' ').any(|e| e == name) {
                    terminate(display);
                    return Err(EglError::MissingExtension { name });
                }
            }

            let choose_attrs: [EglInt; 7] = [
                EGL_RED_SIZE,
                8,
                EGL_GREEN_SIZE,
                8,
                EGL_BLUE_SIZE,
                8,
                EGL_NONE,
            ];
            let mut config: EglConfig = ptr::null_mut();
            let mut num_config = 0;
            if choose_config(display, choose_attrs.as_ptr(), &mut config, 1, &mut num_config)
                == EGL_FALSE
                || num_config < 1
            {
                terminate(display);
                return Err(EglError::Call { function: "eglChooseConfig" });
            }

            let surface = create_window_surface(display, config, x11.root(), ptr::null());
            if surface.is_null() {
                terminate(display);
                return Err(EglError::Call { function: "eglCreateWindowSurface" });
            }

            let context_attrs: [EglInt; 5] = [
                EGL_CONTEXT_MAJOR_VERSION,
                3,
                EGL_CONTEXT_MINOR_VERSION,
                3,
                EGL_NONE,
            ];
            let context =
                create_context(display, config, ptr::null_mut(), context_attrs.as_ptr());
            if context.is_null() {
                terminate(display);
                return Err(EglError::Call { function: "eglCreateContext" });
            }
            if make_current(display, surface, surface, context) == EGL_FALSE {
                terminate(display);
                return Err(EglError::Call { function: "eglMakeCurrent" });
            }

            let create_image_khr: FnCreateImageKhr =
                Self::proc_address(get_proc_address, "eglCreateImageKHR")?;
            let destroy_image_khr: FnDestroyImageKhr =
                Self::proc_address(get_proc_address, "eglDestroyImageKHR")?;
            let export_query_mesa: FnExportDmabufQueryMesa =
                Self::proc_address(get_proc_address, "eglExportDMABUFImageQueryMESA")?;
            let export_mesa: FnExportDmabufMesa =
                Self::proc_address(get_proc_address, "eglExportDMABUFImageMESA")?;

            Ok(Self {
                _lib: lib,
                display,
                config,
                context,
                _surface: surface,
                destroy_surface,
                create_pixmap_surface,
                bind_tex_image,
                release_tex_image,
                get_proc_address,
                create_image_khr,
                destroy_image_khr,
                export_query_mesa,
                export_mesa,
            })
        }
    }

    /// SAFETY: `F` must match the actual prototype of `name`.
    unsafe fn proc_address<F>(
        get_proc_address: FnGetProcAddress,
        name: &'static str,
    ) -> Result<F, EglError> {
        let cname = CString::new(name).map_err(|_| EglError::Call { function: "CString" })?;
        let ptr = unsafe { get_proc_address(cname.as_ptr()) };
        if ptr.is_null() {
            return Err(EglError::Load(format!("{name} not exported")));
        }
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const c_void>());
        // SAFETY: non-null EGL proc address of the requested name; caller
        // guarantees the prototype.
        Ok(unsafe { std::mem::transmute_copy(&ptr) })
    }

    pub fn get_proc_address(&self, name: &str) -> *const c_void {
        let Ok(cname) = CString::new(name) else {
            return ptr::null();
        };
        // SAFETY: cname outlives the call.
        unsafe { (self.get_proc_address)(cname.as_ptr()) }
    }

    /// Wrap an X pixmap into a bindable EGL surface.
    pub fn create_image(&self, pixmap: c_ulong) -> Result<EglSurface, EglError> {
        let attrs: [EglInt; 5] = [
            EGL_TEXTURE_TARGET,
            EGL_TEXTURE_2D,
            EGL_TEXTURE_FORMAT,
            EGL_TEXTURE_RGBA,
            EGL_NONE,
        ];
        // SAFETY: display/config are live; the pixmap id comes from Xlib.
        let surface =
            unsafe { (self.create_pixmap_surface)(self.display, self.config, pixmap, attrs.as_ptr()) };
        if surface.is_null() {
            return Err(EglError::Call { function: "eglCreatePixmapSurface" });
        }
        Ok(surface)
    }

    pub fn destroy_image(&self, surface: EglSurface) {
        // SAFETY: surface came from create_image.
        unsafe {
            (self.destroy_surface)(self.display, surface);
        }
    }

    pub fn bind_tex_image(&self, surface: EglSurface) {
        // SAFETY: surface is a live pixmap surface; binds to the bound texture.
        unsafe {
            (self.bind_tex_image)(self.display, surface, EGL_BACK_BUFFER);
        }
    }

    pub fn release_tex_image(&self, surface: EglSurface) {
        // SAFETY: surface is a live pixmap surface.
        unsafe {
            (self.release_tex_image)(self.display, surface, EGL_BACK_BUFFER);
        }
    }

    /// Wrap a GL texture of the current context into an `EGLImage`.
    pub fn create_gl_image(&self, texture: u32) -> Result<EglImage, EglError> {
        let attrs: [EglInt; 1] = [EGL_NONE];
        // SAFETY: the texture belongs to self.context, which is current.
        let image = unsafe {
            (self.create_image_khr)(
                self.display,
                self.context,
                EGL_GL_TEXTURE_2D_KHR,
                texture as usize as *mut c_void,
                attrs.as_ptr(),
            )
        };
        if image.is_null() {
            return Err(EglError::Call { function: "eglCreateImageKHR" });
        }
        Ok(image)
    }

    pub fn destroy_gl_image(&self, image: EglImage) {
        // SAFETY: image came from create_gl_image.
        unsafe {
            (self.destroy_image_khr)(self.display, image);
        }
    }

    /// Export a single-plane image as a DMA-BUF.
    ///
    /// Returns the owned descriptor plus stride and offset of plane 0.
    pub fn export_dmabuf(&self, image: EglImage) -> Result<(OwnedFd, i32, i32), EglError> {
        let mut fourcc: c_int = 0;
        let mut num_planes: c_int = 0;
        let mut modifiers: u64 = 0;
        // SAFETY: image is live; out params are plain ints.
        if unsafe {
            (self.export_query_mesa)(
                self.display,
                image,
                &mut fourcc,
                &mut num_planes,
                &mut modifiers,
            )
        } == EGL_FALSE
        {
            return Err(EglError::Call { function: "eglExportDMABUFImageQueryMESA" });
        }
        if num_planes != 1 {
            return Err(EglError::ExportPlanes { num_planes });
        }

        let mut fd: c_int = -1;
        let mut stride: EglInt = 0;
        let mut offset: EglInt = 0;
        // SAFETY: image is live; single plane confirmed above.
        if unsafe { (self.export_mesa)(self.display, image, &mut fd, &mut stride, &mut offset) }
            == EGL_FALSE
            || fd < 0
        {
            return Err(EglError::Call { function: "eglExportDMABUFImageMESA" });
        }
        // SAFETY: the export handed us ownership of a fresh descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };
        Ok((fd, stride, offset))
    }
}
