//! yami encoder backend (DMA-BUF input)
//!
//! The vendor library (`libyami_inf.so`) exposes a C function table fetched
//! through `yami_get_funcs`; the encoder runs VA-API on a DRM render node
//! and ingests frames as DMA-BUF descriptors. The helper exports the encode
//! texture with EGL-MESA on every frame, hands the descriptor over as a
//! packed YUY2 surface and closes it again before returning.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::raw::c_int;
use std::path::PathBuf;

use libloading::Library;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{HelperConfig, DEFAULT_YAMI_LIB};
use crate::gpu::egl::{EglError, EglInterface};

use super::{EncodedFrame, EncoderError, FrameKind};

pub const YI_MAJOR: c_int = 0;
pub const YI_MINOR: c_int = 2;

pub const YI_SUCCESS: c_int = 0;

pub const YI_TYPE_H264: c_int = 1;
pub const YI_H264_ENC_FLAGS_PROFILE_MAIN: c_int = 1;
pub const YI_TYPE_DRM: c_int = 1;
pub const YI_YUY2: c_int = 0x110;

pub const fn yi_version_int(major: c_int, minor: c_int) -> c_int {
    (major << 16) | minor
}

#[derive(Debug, Error)]
pub enum YamiError {
    #[error("yami library unavailable: {0}")]
    Load(String),

    #[error("yami version {version:#010x} too old")]
    VersionTooOld { version: i32 },

    #[error("cannot open DRM device {path}: {source}")]
    DrmOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{function}() returned {code}")]
    Call { function: &'static str, code: i32 },

    #[error("library table is missing {function}")]
    MissingFunction { function: &'static str },

    #[error(transparent)]
    Export(#[from] EglError),
}

type YamiFn = Option<unsafe extern "C" fn() -> c_int>;

/// Function table as laid out by the vendor header. Only a handful of
/// entries are called; the rest are carried to keep the ABI layout intact.
#[repr(C)]
#[derive(Clone, Copy)]
struct YamiFuncs {
    yami_get_version: Option<unsafe extern "C" fn(*mut c_int) -> c_int>,
    yami_init: Option<unsafe extern "C" fn(c_int, *mut c_void) -> c_int>,
    yami_deinit: Option<unsafe extern "C" fn() -> c_int>,

    yami_encoder_create:
        Option<unsafe extern "C" fn(*mut *mut c_void, c_int, c_int, c_int, c_int) -> c_int>,
    yami_encoder_delete: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    yami_encoder_get_width: YamiFn,
    yami_encoder_get_height: YamiFn,
    yami_encoder_resize: YamiFn,
    yami_encoder_get_ybuffer: YamiFn,
    yami_encoder_get_uvbuffer: YamiFn,
    yami_encoder_set_fd_src: Option<
        unsafe extern "C" fn(*mut c_void, c_int, c_int, c_int, c_int, c_int, c_int) -> c_int,
    >,
    yami_encoder_encode:
        Option<unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_int, c_int) -> c_int>,

    yami_decoder_create: YamiFn,
    yami_decoder_delete: YamiFn,
    yami_decoder_decode: YamiFn,
    yami_decoder_decode_time: YamiFn,
    yami_decoder_get_pixmap: YamiFn,
    yami_decoder_get_fd_dst: YamiFn,

    yami_surface_create: YamiFn,
    yami_surface_delete: YamiFn,
    yami_surface_get_ybuffer: YamiFn,
    yami_surface_get_uvbuffer: YamiFn,
    yami_surface_get_fd_dst: YamiFn,
}

type YamiGetFuncsProc = unsafe extern "C" fn(*mut YamiFuncs, c_int) -> c_int;

/// Loaded vendor library plus the initialised DRM session.
pub struct YamiRuntime {
    _lib: Library,
    funcs: YamiFuncs,
    _drm: File,
}

macro_rules! yami_call {
    ($funcs:expr, $name:ident ( $($arg:expr),* )) => {{
        let f = $funcs.$name.ok_or(YamiError::MissingFunction {
            function: stringify!($name),
        })?;
        // SAFETY: the table came from the vendor library's yami_get_funcs
        // and the declared prototypes mirror its header.
        let code = unsafe { f($($arg),*) };
        if code != YI_SUCCESS {
            return Err(YamiError::Call {
                function: stringify!($name),
                code,
            }
            .into());
        }
    }};
}

impl YamiRuntime {
    pub fn init(config: &HelperConfig) -> Result<Self, YamiError> {
        let lib = Self::load_library(config)?;

        // SAFETY: the symbol type matches the exported prototype.
        let get_funcs = unsafe {
            *lib.get::<YamiGetFuncsProc>(b"yami_get_funcs\0")
                .map_err(|e| YamiError::Load(e.to_string()))?
        };

        // SAFETY: the table is plain function pointers, zero means absent.
        let mut funcs: YamiFuncs = unsafe { std::mem::zeroed() };
        let wanted = yi_version_int(YI_MAJOR, YI_MINOR);
        // SAFETY: get_funcs fills the table it was compiled against; the
        // version argument keeps mismatched layouts from being filled.
        let code = unsafe { get_funcs(&mut funcs, wanted) };
        if code != YI_SUCCESS {
            return Err(YamiError::Call {
                function: "yami_get_funcs",
                code,
            });
        }

        let mut version: c_int = 0;
        yami_call!(funcs, yami_get_version(&mut version));
        if version < wanted {
            return Err(YamiError::VersionTooOld { version });
        }
        info!(version = format_args!("{version:#010x}"), "yami runtime ready");

        let drm = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.drm_device)
            .map_err(|source| YamiError::DrmOpen {
                path: config.drm_device.clone(),
                source,
            })?;
        debug!(path = %config.drm_device.display(), fd = drm.as_raw_fd(), "DRM node open");

        yami_call!(
            funcs,
            yami_init(YI_TYPE_DRM, drm.as_raw_fd() as isize as *mut c_void)
        );

        Ok(Self {
            _lib: lib,
            funcs,
            _drm: drm,
        })
    }

    fn load_library(config: &HelperConfig) -> Result<Library, YamiError> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = &config.yami_lib {
            candidates.push(path.clone());
        } else {
            candidates.push(PathBuf::from(DEFAULT_YAMI_LIB));
            candidates.push(PathBuf::from("libyami_inf.so"));
        }

        let mut last_err = String::new();
        for path in &candidates {
            // SAFETY: loading the vendor library runs its constructors,
            // which is the point of the call.
            match unsafe { Library::new(path) } {
                Ok(lib) => {
                    info!(path = %path.display(), "loaded yami library");
                    return Ok(lib);
                }
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(YamiError::Load(last_err))
    }

    pub fn create_encoder(&mut self, width: u16, height: u16) -> Result<YamiEncoder, YamiError> {
        let mut handle: *mut c_void = std::ptr::null_mut();
        yami_call!(
            self.funcs,
            yami_encoder_create(
                &mut handle,
                width as c_int,
                height as c_int,
                YI_TYPE_H264,
                YI_H264_ENC_FLAGS_PROFILE_MAIN
            )
        );
        debug!(width, height, "yami encoder created");
        Ok(YamiEncoder {
            handle,
            width,
            height,
            frame_count: 0,
        })
    }

    pub fn destroy_encoder(&mut self, encoder: YamiEncoder) {
        if let Some(f) = self.funcs.yami_encoder_delete {
            // SAFETY: handle came from yami_encoder_create.
            let code = unsafe { f(encoder.handle) };
            if code != YI_SUCCESS {
                warn!(code, "yami_encoder_delete failed");
            }
        }
    }

    /// Export `texture` as a DMA-BUF and encode it into `dst`.
    ///
    /// The exported descriptor and the intermediate EGL image are released
    /// on every path out of this function.
    pub fn encode(
        &mut self,
        encoder: &mut YamiEncoder,
        egl: &EglInterface,
        texture: u32,
        dst: &mut [u8],
        force_key_frame: bool,
    ) -> Result<EncodedFrame, EncoderError> {
        let image = egl.create_gl_image(texture).map_err(YamiError::Export)?;
        let guard = ImageGuard { egl, image };

        let (fd, stride, _offset) = egl.export_dmabuf(image).map_err(YamiError::Export)?;

        yami_call!(
            self.funcs,
            yami_encoder_set_fd_src(
                encoder.handle,
                fd.as_raw_fd(),
                encoder.width as c_int,
                encoder.height as c_int,
                stride,
                stride * encoder.height as c_int,
                YI_YUY2
            )
        );

        let force = force_key_frame || encoder.frame_count == 0;
        if force {
            debug!(frame = encoder.frame_count, "forcing H.264 key frame");
        }

        let mut cdata_bytes = dst.len() as c_int;
        yami_call!(
            self.funcs,
            yami_encoder_encode(
                encoder.handle,
                dst.as_mut_ptr() as *mut c_void,
                &mut cdata_bytes,
                force as c_int
            )
        );
        encoder.frame_count += 1;

        drop(guard);
        drop(fd);

        Ok(EncodedFrame {
            len: cdata_bytes as usize,
            kind: if force { FrameKind::Key } else { FrameKind::Delta },
        })
    }
}

impl Drop for YamiRuntime {
    fn drop(&mut self) {
        if let Some(f) = self.funcs.yami_deinit {
            // SAFETY: runtime teardown, nothing uses the library afterwards.
            unsafe {
                f();
            }
        }
    }
}

/// Per-monitor yami encoder.
pub struct YamiEncoder {
    handle: *mut c_void,
    width: u16,
    height: u16,
    frame_count: u64,
}

impl YamiEncoder {
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }
}

/// Destroys the exported EGL image on drop so no exit path leaks it.
struct ImageGuard<'a> {
    egl: &'a EglInterface,
    image: crate::gpu::egl::EglImage,
}

impl Drop for ImageGuard<'_> {
    fn drop(&mut self) {
        self.egl.destroy_gl_image(self.image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_packing() {
        assert_eq!(yi_version_int(0, 2), 2);
        assert_eq!(yi_version_int(1, 0), 0x10000);
        assert_eq!(yi_version_int(2, 5), 0x20005);
    }

    #[test]
    fn function_table_matches_header_entry_count() {
        // 23 entries in the vendor header; a drifted layout would call
        // through the wrong slot.
        assert_eq!(
            std::mem::size_of::<YamiFuncs>(),
            23 * std::mem::size_of::<YamiFn>()
        );
    }
}
