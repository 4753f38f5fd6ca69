//! NVENC encoder backend (OpenGL-texture input)
//!
//! The encode session is opened as an OpenGL device against the current GLX
//! context, and the per-monitor encode texture is registered once as the
//! session's input resource, so frames never leave the GPU. The function
//! table comes from `NvEncodeAPICreateInstance` out of
//! `libnvidia-encode.so`; struct and enum definitions are the
//! Video Codec SDK bindings.
//!
//! Session shape: H.264 main profile, infinite GoP, P-frames only,
//! quarter-pel motion vectors, constant QP 28.

use std::ffi::c_void;
use std::ptr;

use libloading::Library;
use nvidia_video_codec_sdk::sys::nvEncodeAPI as nv;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gpu::monitor::OutputLayout;

use super::{EncodedFrame, EncoderError, FrameKind};

#[derive(Debug, Error)]
pub enum NvencError {
    #[error("libnvidia-encode unavailable: {0}")]
    Load(String),

    #[error("{function}() returned {status}")]
    Call { function: &'static str, status: i32 },

    #[error("API table is missing {function}")]
    MissingFunction { function: &'static str },
}

type CreateInstanceProc =
    unsafe extern "C" fn(*mut nv::NV_ENCODE_API_FUNCTION_LIST) -> nv::NVENCSTATUS;

macro_rules! nv_call {
    ($funcs:expr, $name:ident ( $($arg:expr),* )) => {{
        let f = $funcs.$name.ok_or(NvencError::MissingFunction {
            function: stringify!($name),
        })?;
        // SAFETY: the function list was filled by NvEncodeAPICreateInstance
        // and every argument follows the SDK's calling convention.
        let status = unsafe { f($($arg),*) };
        if status != nv::NVENCSTATUS::NV_ENC_SUCCESS {
            return Err(NvencError::Call {
                function: stringify!($name),
                status: status as i32,
            }
            .into());
        }
    }};
}

/// Loaded encode library plus its resolved API table.
pub struct NvencRuntime {
    _lib: Library,
    funcs: nv::NV_ENCODE_API_FUNCTION_LIST,
}

impl NvencRuntime {
    pub fn init() -> Result<Self, NvencError> {
        let lib = ["libnvidia-encode.so.1", "libnvidia-encode.so"]
            .iter()
            .find_map(|name| unsafe { Library::new(name) }.ok())
            .ok_or_else(|| NvencError::Load("libnvidia-encode.so not found".into()))?;

        // SAFETY: the symbol type matches the exported prototype.
        let create_instance = unsafe {
            *lib.get::<CreateInstanceProc>(b"NvEncodeAPICreateInstance\0")
                .map_err(|e| NvencError::Load(e.to_string()))?
        };

        // SAFETY: the list is a plain struct of function pointers.
        let mut funcs: nv::NV_ENCODE_API_FUNCTION_LIST = unsafe { std::mem::zeroed() };
        funcs.version = nv::NV_ENCODE_API_FUNCTION_LIST_VER;
        // SAFETY: funcs.version announces the layout we allocated.
        let status = unsafe { create_instance(&mut funcs) };
        if status != nv::NVENCSTATUS::NV_ENC_SUCCESS {
            return Err(NvencError::Call {
                function: "NvEncodeAPICreateInstance",
                status: status as i32,
            });
        }
        info!("NVENC API instance created");

        Ok(Self { _lib: lib, funcs })
    }

    /// Open a session for one monitor and register its encode texture.
    pub fn create_encoder(
        &mut self,
        width: u16,
        height: u16,
        texture: u32,
        layout: OutputLayout,
    ) -> Result<NvencEncoder, NvencError> {
        // SAFETY: zero baseline for an SDK struct, version set before use.
        let mut open_params: nv::NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS =
            unsafe { std::mem::zeroed() };
        open_params.version = nv::NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER;
        open_params.deviceType = nv::NV_ENC_DEVICE_TYPE::NV_ENC_DEVICE_TYPE_OPENGL;
        open_params.apiVersion = nv::NVENCAPI_VERSION;

        let mut session: *mut c_void = ptr::null_mut();
        nv_call!(self.funcs, nvEncOpenEncodeSessionEx(&mut open_params, &mut session));
        debug!(?session, "NVENC session open");

        match self.configure_session(session, width, height, texture, layout) {
            Ok(encoder) => Ok(encoder),
            Err(e) => {
                if let Some(destroy) = self.funcs.nvEncDestroyEncoder {
                    // SAFETY: session was opened above and is unused after this.
                    unsafe {
                        destroy(session);
                    }
                }
                Err(e)
            }
        }
    }

    fn configure_session(
        &mut self,
        session: *mut c_void,
        width: u16,
        height: u16,
        texture: u32,
        layout: OutputLayout,
    ) -> Result<NvencEncoder, NvencError> {
        let width = width as u32;
        let height = height as u32;

        // SAFETY: zero baseline for an SDK struct, version set before use.
        let mut enc_cfg: nv::NV_ENC_CONFIG = unsafe { std::mem::zeroed() };
        enc_cfg.version = nv::NV_ENC_CONFIG_VER;
        enc_cfg.profileGUID = nv::NV_ENC_H264_PROFILE_MAIN_GUID;
        enc_cfg.gopLength = nv::NVENC_INFINITE_GOPLENGTH;
        enc_cfg.frameIntervalP = 1; /* 1 + B frame count */
        enc_cfg.frameFieldMode =
            nv::NV_ENC_PARAMS_FRAME_FIELD_MODE::NV_ENC_PARAMS_FRAME_FIELD_MODE_FRAME;
        enc_cfg.mvPrecision = nv::NV_ENC_MV_PRECISION::NV_ENC_MV_PRECISION_QUARTER_PEL;
        enc_cfg.rcParams.rateControlMode = nv::NV_ENC_PARAMS_RC_MODE::NV_ENC_PARAMS_RC_CONSTQP;
        enc_cfg.rcParams.averageBitRate = 5_000_000;
        enc_cfg.rcParams.constQP.qpInterP = 28;
        enc_cfg.rcParams.constQP.qpInterB = 28;
        enc_cfg.rcParams.constQP.qpIntra = 28;
        // SAFETY: encodeCodecConfig is a union; h264Config is the member for
        // the H.264 codec selected below.
        unsafe {
            let h264 = &mut enc_cfg.encodeCodecConfig.h264Config;
            h264.chromaFormatIDC = 1;
            h264.idrPeriod = nv::NVENC_INFINITE_GOPLENGTH;
        }

        // SAFETY: zero baseline for an SDK struct, version set before use.
        let mut init_params: nv::NV_ENC_INITIALIZE_PARAMS = unsafe { std::mem::zeroed() };
        init_params.version = nv::NV_ENC_INITIALIZE_PARAMS_VER;
        init_params.encodeGUID = nv::NV_ENC_CODEC_H264_GUID;
        init_params.encodeWidth = width;
        init_params.encodeHeight = height;
        init_params.darWidth = width;
        init_params.darHeight = height;
        init_params.frameRateNum = 30;
        init_params.frameRateDen = 1;
        init_params.enablePTD = 1;
        init_params.encodeConfig = &mut enc_cfg;
        nv_call!(self.funcs, nvEncInitializeEncoder(session, &mut init_params));

        // SAFETY: zero baseline for an SDK struct.
        let mut gl_tex: nv::NV_ENC_INPUT_RESOURCE_OPENGL_TEX = unsafe { std::mem::zeroed() };
        gl_tex.texture = texture;
        gl_tex.target = glow::TEXTURE_2D;

        // SAFETY: zero baseline for an SDK struct, version set before use.
        let mut reg: nv::NV_ENC_REGISTER_RESOURCE = unsafe { std::mem::zeroed() };
        reg.version = nv::NV_ENC_REGISTER_RESOURCE_VER;
        reg.resourceType = nv::NV_ENC_INPUT_RESOURCE_TYPE::NV_ENC_INPUT_RESOURCE_TYPE_OPENGL_TEX;
        reg.width = width;
        reg.height = height;
        match layout {
            OutputLayout::Yuv420 => {
                reg.pitch = width;
                reg.bufferFormat = nv::NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_NV12;
            }
            _ => {
                reg.pitch = width * 4;
                reg.bufferFormat = nv::NV_ENC_BUFFER_FORMAT::NV_ENC_BUFFER_FORMAT_AYUV;
            }
        }
        reg.resourceToRegister = &mut gl_tex as *mut _ as *mut c_void;
        reg.bufferUsage = nv::NV_ENC_BUFFER_USAGE::NV_ENC_INPUT_IMAGE;
        nv_call!(self.funcs, nvEncRegisterResource(session, &mut reg));

        // SAFETY: zero baseline for an SDK struct, version set before use.
        let mut map: nv::NV_ENC_MAP_INPUT_RESOURCE = unsafe { std::mem::zeroed() };
        map.version = nv::NV_ENC_MAP_INPUT_RESOURCE_VER;
        map.registeredResource = reg.registeredResource;
        nv_call!(self.funcs, nvEncMapInputResource(session, &mut map));

        // SAFETY: zero baseline for an SDK struct, version set before use.
        let mut bitstream_params: nv::NV_ENC_CREATE_BITSTREAM_BUFFER =
            unsafe { std::mem::zeroed() };
        bitstream_params.version = nv::NV_ENC_CREATE_BITSTREAM_BUFFER_VER;
        nv_call!(self.funcs, nvEncCreateBitstreamBuffer(session, &mut bitstream_params));

        info!(width, height, ?layout, "NVENC encoder ready");

        Ok(NvencEncoder {
            session,
            registered: reg.registeredResource,
            mapped: map.mappedResource,
            mapped_format: map.mappedBufferFmt,
            bitstream: bitstream_params.bitstreamBuffer,
            width,
            height,
            frame_count: 0,
        })
    }

    pub fn destroy_encoder(&mut self, encoder: NvencEncoder) {
        let funcs = &self.funcs;
        // SAFETY: every handle came from this session; teardown order is
        // mapped resource, registration, bitstream buffer, session.
        unsafe {
            if let Some(f) = funcs.nvEncUnmapInputResource {
                if f(encoder.session, encoder.mapped) != nv::NVENCSTATUS::NV_ENC_SUCCESS {
                    warn!("nvEncUnmapInputResource failed");
                }
            }
            if let Some(f) = funcs.nvEncUnregisterResource {
                if f(encoder.session, encoder.registered) != nv::NVENCSTATUS::NV_ENC_SUCCESS {
                    warn!("nvEncUnregisterResource failed");
                }
            }
            if let Some(f) = funcs.nvEncDestroyBitstreamBuffer {
                if f(encoder.session, encoder.bitstream) != nv::NVENCSTATUS::NV_ENC_SUCCESS {
                    warn!("nvEncDestroyBitstreamBuffer failed");
                }
            }
            if let Some(f) = funcs.nvEncDestroyEncoder {
                if f(encoder.session) != nv::NVENCSTATUS::NV_ENC_SUCCESS {
                    warn!("nvEncDestroyEncoder failed");
                }
            }
        }
    }

    /// Encode the registered texture's current contents into `dst`.
    pub fn encode(
        &mut self,
        encoder: &mut NvencEncoder,
        dst: &mut [u8],
    ) -> Result<EncodedFrame, EncoderError> {
        // SAFETY: zero baseline for an SDK struct, version set before use.
        let mut pic: nv::NV_ENC_PIC_PARAMS = unsafe { std::mem::zeroed() };
        pic.version = nv::NV_ENC_PIC_PARAMS_VER;
        pic.inputBuffer = encoder.mapped;
        pic.bufferFmt = encoder.mapped_format;
        pic.inputWidth = encoder.width;
        pic.inputHeight = encoder.height;
        pic.outputBitstream = encoder.bitstream;
        pic.inputTimeStamp = encoder.frame_count;
        pic.pictureStruct = nv::NV_ENC_PIC_STRUCT::NV_ENC_PIC_STRUCT_FRAME;
        nv_call!(self.funcs, nvEncEncodePicture(encoder.session, &mut pic));

        // SAFETY: zero baseline for an SDK struct, version set before use.
        let mut lock: nv::NV_ENC_LOCK_BITSTREAM = unsafe { std::mem::zeroed() };
        lock.version = nv::NV_ENC_LOCK_BITSTREAM_VER;
        lock.outputBitstream = encoder.bitstream;
        nv_call!(self.funcs, nvEncLockBitstream(encoder.session, &mut lock));

        let size = lock.bitstreamSizeInBytes as usize;
        let result = if size <= dst.len() {
            // SAFETY: bitstreamBufferPtr points at `size` locked bytes.
            unsafe {
                ptr::copy_nonoverlapping(
                    lock.bitstreamBufferPtr as *const u8,
                    dst.as_mut_ptr(),
                    size,
                );
            }
            let kind = match lock.pictureType {
                nv::NV_ENC_PIC_TYPE::NV_ENC_PIC_TYPE_IDR | nv::NV_ENC_PIC_TYPE::NV_ENC_PIC_TYPE_I => {
                    FrameKind::Key
                }
                _ => FrameKind::Delta,
            };
            encoder.frame_count += 1;
            Ok(EncodedFrame { len: size, kind })
        } else {
            Err(EncoderError::OutputTooSmall {
                needed: size,
                available: dst.len(),
            })
        };

        if let Some(f) = self.funcs.nvEncUnlockBitstream {
            // SAFETY: the bitstream was locked above.
            let status = unsafe { f(encoder.session, encoder.bitstream) };
            if status != nv::NVENCSTATUS::NV_ENC_SUCCESS {
                warn!(status = status as i32, "nvEncUnlockBitstream failed");
            }
        }

        result
    }
}

/// Per-monitor NVENC session with its registered texture and output buffer.
pub struct NvencEncoder {
    session: *mut c_void,
    registered: nv::NV_ENC_REGISTERED_PTR,
    mapped: nv::NV_ENC_INPUT_PTR,
    mapped_format: nv::NV_ENC_BUFFER_FORMAT,
    bitstream: nv::NV_ENC_OUTPUT_PTR,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl NvencEncoder {
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
