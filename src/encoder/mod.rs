//! Hardware H.264 encoder backends
//!
//! Two vendors, two ingestion models:
//!
//! - **NVENC** (`nvenc` feature) opens an OpenGL-device encode session and
//!   registers the encode texture directly as its input resource.
//! - **yami** exports the encode texture as a DMA-BUF through EGL and hands
//!   the descriptor to the vendor library, which drives VA-API underneath.
//!
//! The pairing with the GL interface is fixed at init (GLX+NVENC,
//! EGL+yami); a context handed to the wrong runtime is a hard error rather
//! than undefined vendor behaviour.

pub mod yami;

#[cfg(feature = "nvenc")]
pub mod nvenc;

use thiserror::Error;

use crate::config::HelperConfig;
use crate::gpu::backend::GlInterface;
use crate::gpu::monitor::OutputLayout;

pub use self::yami::YamiError;

#[cfg(feature = "nvenc")]
pub use self::nvenc::NvencError;

/// Whether the encoder produced a key frame or a delta frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Key,
    Delta,
}

/// One successfully encoded frame, written into the caller's buffer.
#[derive(Debug, Clone, Copy)]
pub struct EncodedFrame {
    pub len: usize,
    pub kind: FrameKind,
}

#[derive(Debug, Error)]
pub enum EncoderError {
    /// The encoded frame did not fit the caller's buffer. The encoder
    /// itself is left usable; only this frame is lost.
    #[error("output buffer too small: frame is {needed} bytes, buffer {available}")]
    OutputTooSmall { needed: usize, available: usize },

    /// The selected backend was not compiled in.
    #[error("{backend} support not built into this binary")]
    NotBuilt { backend: &'static str },

    /// Context and runtime belong to different backends.
    #[error("encoder context does not match the {runtime} runtime")]
    BackendMismatch { runtime: &'static str },

    #[error("yami: {0}")]
    Yami(#[from] YamiError),

    #[cfg(feature = "nvenc")]
    #[error("nvenc: {0}")]
    Nvenc(#[from] NvencError),
}

/// Process-wide encoder state: loaded vendor library plus its session-level
/// handles. Lives in the GPU root object for the life of the process.
pub enum EncoderRuntime {
    Yami(yami::YamiRuntime),
    #[cfg(feature = "nvenc")]
    Nvenc(nvenc::NvencRuntime),
}

/// Per-monitor encoder state.
pub enum EncoderContext {
    Yami(yami::YamiEncoder),
    #[cfg(feature = "nvenc")]
    Nvenc(nvenc::NvencEncoder),
}

impl EncoderContext {
    /// Frames successfully submitted through this context.
    pub fn frame_count(&self) -> u64 {
        match self {
            EncoderContext::Yami(enc) => enc.frame_count(),
            #[cfg(feature = "nvenc")]
            EncoderContext::Nvenc(enc) => enc.frame_count(),
        }
    }
}

impl EncoderRuntime {
    pub fn init_yami(config: &HelperConfig) -> Result<Self, EncoderError> {
        Ok(EncoderRuntime::Yami(yami::YamiRuntime::init(config)?))
    }

    #[cfg(feature = "nvenc")]
    pub fn init_nvenc() -> Result<Self, EncoderError> {
        Ok(EncoderRuntime::Nvenc(nvenc::NvencRuntime::init()?))
    }

    #[cfg(not(feature = "nvenc"))]
    pub fn init_nvenc() -> Result<Self, EncoderError> {
        Err(EncoderError::NotBuilt { backend: "nvenc" })
    }

    pub fn name(&self) -> &'static str {
        match self {
            EncoderRuntime::Yami(_) => "yami",
            #[cfg(feature = "nvenc")]
            EncoderRuntime::Nvenc(_) => "nvenc",
        }
    }

    /// The encode-texture layout this backend ingests.
    pub fn preferred_layout(&self) -> OutputLayout {
        match self {
            EncoderRuntime::Yami(_) => OutputLayout::Yuv422,
            #[cfg(feature = "nvenc")]
            EncoderRuntime::Nvenc(_) => OutputLayout::Yuv420,
        }
    }

    #[cfg_attr(not(feature = "nvenc"), allow(unused_variables))]
    pub fn create_context(
        &mut self,
        width: u16,
        height: u16,
        texture: u32,
        layout: OutputLayout,
    ) -> Result<EncoderContext, EncoderError> {
        match self {
            EncoderRuntime::Yami(runtime) => Ok(EncoderContext::Yami(
                runtime.create_encoder(width, height)?,
            )),
            #[cfg(feature = "nvenc")]
            EncoderRuntime::Nvenc(runtime) => Ok(EncoderContext::Nvenc(
                runtime.create_encoder(width, height, texture, layout)?,
            )),
        }
    }

    pub fn destroy_context(&mut self, context: EncoderContext) {
        match (self, context) {
            (EncoderRuntime::Yami(runtime), EncoderContext::Yami(enc)) => {
                runtime.destroy_encoder(enc);
            }
            #[cfg(feature = "nvenc")]
            (EncoderRuntime::Nvenc(runtime), EncoderContext::Nvenc(enc)) => {
                runtime.destroy_encoder(enc);
            }
            #[cfg(feature = "nvenc")]
            _ => {}
        }
    }

    /// Encode the current contents of the encode texture into `dst`.
    pub fn encode(
        &mut self,
        context: &mut EncoderContext,
        gl_interface: &GlInterface,
        texture: u32,
        dst: &mut [u8],
        force_key_frame: bool,
    ) -> Result<EncodedFrame, EncoderError> {
        match (self, context) {
            (EncoderRuntime::Yami(runtime), EncoderContext::Yami(enc)) => {
                let egl = gl_interface.egl().ok_or(EncoderError::BackendMismatch {
                    runtime: "yami",
                })?;
                runtime.encode(enc, egl, texture, dst, force_key_frame)
            }
            #[cfg(feature = "nvenc")]
            (EncoderRuntime::Nvenc(runtime), EncoderContext::Nvenc(enc)) => {
                runtime.encode(enc, dst)
            }
            #[cfg(feature = "nvenc")]
            (runtime, _) => Err(EncoderError::BackendMismatch {
                runtime: runtime.name(),
            }),
        }
    }
}
