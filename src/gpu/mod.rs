//! GPU pipeline root
//!
//! [`GpuContext`] is the single process-wide object behind the encode path:
//! the X connection, the selected GL interface (EGL or GLX), the compiled
//! shader set, the off-screen framebuffer, the monitor table and the vendor
//! encoder runtime. It is created once before the event loop and passed by
//! reference wherever the dispatch layer needs it.
//!
//! Backend selection keys off the X server: an NVIDIA server (detected via
//! its `NV-CONTROL` extension) pairs GLX with the texture-input encoder,
//! anything else pairs EGL with the DMA-BUF encoder.

pub mod backend;
pub mod egl;
pub mod glx;
pub mod monitor;
pub mod shaders;
pub mod vertices;
pub mod x11;

use std::os::fd::RawFd;

use glow::HasContext;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::HelperConfig;
use crate::encoder::{EncoderError, EncoderRuntime, FrameKind};

use self::backend::GlInterface;
use self::egl::EglInterface;
use self::glx::GlxInterface;
use self::monitor::Monitor;
use self::shaders::ShaderSet;
use self::x11::{X11Display, X11Error};

/// Monitor slots per session.
pub const MAX_MONITORS: usize = 16;

/// A dirty rectangle in monitor coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

/// Table slot for a monitor id.
pub fn monitor_slot(mon_id: u32) -> usize {
    mon_id as usize % MAX_MONITORS
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error(transparent)]
    X11(#[from] X11Error),

    #[error("egl: {0}")]
    Egl(egl::EglError),

    #[error("glx: {0}")]
    Glx(glx::GlxError),

    #[error("gl: {0}")]
    Gl(String),

    #[error("OpenGL {major}.{minor} too old, need 3.0")]
    GlTooOld { major: u32, minor: u32 },

    #[error("shader build failed: {log}")]
    Shader { log: String },

    #[error("monitor slot {slot} already occupied")]
    MonitorExists { slot: usize },

    #[error("no monitor in slot {slot}")]
    NoMonitor { slot: usize },

    #[error("size mismatch: monitor is {monitor_w}x{monitor_h}, update says {update_w}x{update_h}")]
    SizeMismatch {
        monitor_w: u16,
        monitor_h: u16,
        update_w: u16,
        update_h: u16,
    },

    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

/// Process-wide GPU state. Single-threaded by construction; every GL call
/// happens on the thread that created the context.
pub struct GpuContext {
    encoders: EncoderRuntime,
    gl: glow::Context,
    shaders: ShaderSet,
    fbo: glow::Framebuffer,
    monitors: [Option<Monitor>; MAX_MONITORS],
    // declaration order keeps the GL context alive until after the
    // backend drops, and the X display until after both
    backend: GlInterface,
    x11: X11Display,
}

impl GpuContext {
    pub fn init(config: &HelperConfig) -> Result<Self, GpuError> {
        let x11 = X11Display::open()?;

        let (backend, encoders) = if x11.has_extension("NV-CONTROL") {
            info!("detected NVIDIA XServer, using GLX");
            let glx = GlxInterface::init(&x11)?;
            (GlInterface::Glx(glx), EncoderRuntime::init_nvenc()?)
        } else {
            info!("using EGL");
            let egl = EglInterface::init(&x11)?;
            (GlInterface::Egl(egl), EncoderRuntime::init_yami(config)?)
        };

        // SAFETY: a context is current on this thread since backend init.
        let gl = unsafe {
            glow::Context::from_loader_function(|name| backend.get_proc_address(name))
        };
        let version = gl.version();
        if version.major < 3 {
            return Err(GpuError::GlTooOld {
                major: version.major,
                minor: version.minor,
            });
        }
        // SAFETY: trivial state queries on the current context.
        unsafe {
            info!(
                vendor = %gl.get_parameter_string(glow::VENDOR),
                version = %gl.get_parameter_string(glow::VERSION),
                interface = backend.name(),
                encoder = encoders.name(),
                "GL ready"
            );
        }

        let shaders = ShaderSet::compile(&gl)?;
        // SAFETY: context is current.
        let fbo = unsafe { gl.create_framebuffer().map_err(GpuError::Gl)? };

        Ok(Self {
            encoders,
            gl,
            shaders,
            fbo,
            monitors: Default::default(),
            backend,
            x11,
        })
    }

    /// Descriptor of the X connection for the event loop's wait set.
    pub fn connection_fd(&self) -> RawFd {
        self.x11.connection_fd()
    }

    /// Drain pending X events.
    pub fn pump_events(&mut self) {
        self.x11.pump_events();
    }

    pub fn monitor(&self, mon_id: u32) -> Option<&Monitor> {
        self.monitors[monitor_slot(mon_id)].as_ref()
    }

    /// Ask every live monitor for a key frame on its next encode.
    pub fn request_key_frames(&mut self) {
        for monitor in self.monitors.iter_mut().flatten() {
            monitor.request_key_frame();
        }
    }

    /// Create the per-monitor encode state for slot `mon_id % 16`.
    ///
    /// The `magic`/`con_id`/`mon_id` triple is painted into the pixmap's
    /// top-left 4x4 pixels so the display server can recognise the imported
    /// pixmap. Construction is all-or-nothing: any failure releases every
    /// resource created so far and leaves the slot empty.
    pub fn create_monitor(
        &mut self,
        width: u16,
        height: u16,
        magic: u32,
        con_id: u32,
        mon_id: u32,
    ) -> Result<(), GpuError> {
        let slot = monitor_slot(mon_id);
        if self.monitors[slot].is_some() {
            return Err(GpuError::MonitorExists { slot });
        }
        info!(width, height, magic = format_args!("{magic:#010x}"), con_id, mon_id, "create monitor");

        let gl = &self.gl;
        let layout = self.encoders.preferred_layout();

        let pixmap = self.x11.create_pixmap(width, height);
        let image = match self.backend.create_image(pixmap) {
            Ok(image) => image,
            Err(e) => {
                self.x11.free_pixmap(pixmap);
                return Err(e);
            }
        };
        if let Err(e) = self.x11.tag_pixmap(pixmap, magic, con_id, mon_id) {
            self.backend.destroy_image(image);
            self.x11.free_pixmap(pixmap);
            return Err(e.into());
        }

        // SAFETY: context is current; texture setup is self-contained.
        let textures = unsafe {
            let enc_texture = match gl.create_texture() {
                Ok(t) => t,
                Err(e) => {
                    self.backend.destroy_image(image);
                    self.x11.free_pixmap(pixmap);
                    return Err(GpuError::Gl(e));
                }
            };
            gl.bind_texture(glow::TEXTURE_2D, Some(enc_texture));
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MIN_FILTER,
                glow::NEAREST as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MAG_FILTER,
                glow::NEAREST as i32,
            );
            let (tex_w, tex_h) = layout.texture_size(width, height);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                layout.internal_format(),
                tex_w,
                tex_h,
                0,
                layout.pixel_format(),
                glow::UNSIGNED_BYTE,
                None,
            );

            // source texture gets its storage from the bound pixmap
            let bmp_texture = match gl.create_texture() {
                Ok(t) => t,
                Err(e) => {
                    gl.delete_texture(enc_texture);
                    self.backend.destroy_image(image);
                    self.x11.free_pixmap(pixmap);
                    return Err(GpuError::Gl(e));
                }
            };
            gl.bind_texture(glow::TEXTURE_2D, Some(bmp_texture));
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MIN_FILTER,
                glow::NEAREST as i32,
            );
            gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MAG_FILTER,
                glow::NEAREST as i32,
            );
            gl.bind_texture(glow::TEXTURE_2D, None);

            (enc_texture, bmp_texture)
        };
        let (enc_texture, bmp_texture) = textures;

        let encoder =
            match self
                .encoders
                .create_context(width, height, enc_texture.0.get(), layout)
            {
                Ok(encoder) => encoder,
                Err(e) => {
                    // SAFETY: textures belong to the current context.
                    unsafe {
                        gl.delete_texture(bmp_texture);
                        gl.delete_texture(enc_texture);
                    }
                    self.backend.destroy_image(image);
                    self.x11.free_pixmap(pixmap);
                    return Err(e.into());
                }
            };

        self.monitors[slot] = Some(Monitor {
            width,
            height,
            pixmap,
            image,
            bmp_texture,
            enc_texture,
            layout,
            viewport: layout.viewport(width, height),
            encoder,
            pending_key_frames: 0,
        });
        Ok(())
    }

    /// Tear down every monitor's GPU and encoder state.
    pub fn delete_all_monitors(&mut self) {
        for slot in 0..MAX_MONITORS {
            if let Some(monitor) = self.monitors[slot].take() {
                debug!(slot, "deleting monitor");
                self.encoders.destroy_context(monitor.encoder);
                // SAFETY: textures belong to the current context.
                unsafe {
                    self.gl.delete_texture(monitor.bmp_texture);
                    self.gl.delete_texture(monitor.enc_texture);
                }
                self.backend.destroy_image(monitor.image);
                self.x11.free_pixmap(monitor.pixmap);
            }
        }
    }

    /// Convert and encode one frame for `mon_id`.
    ///
    /// Runs the RGB→YUV pass over the dirty rectangles (full screen when
    /// none), fences, and hands the encode texture to the encoder backend.
    /// Returns the number of compressed bytes written into `dst`.
    pub fn encode_dirty(
        &mut self,
        mon_id: u32,
        width: u16,
        height: u16,
        crects: &[Rect],
        dst: &mut [u8],
    ) -> Result<usize, GpuError> {
        let slot = monitor_slot(mon_id);
        let monitor = self.monitors[slot]
            .as_mut()
            .ok_or(GpuError::NoMonitor { slot })?;
        if (width, height) != (monitor.width, monitor.height) {
            return Err(GpuError::SizeMismatch {
                monitor_w: monitor.width,
                monitor_h: monitor.height,
                update_w: width,
                update_h: height,
            });
        }

        let gl = &self.gl;
        let shader = self.shaders.get(monitor.layout.shader());
        let (vertex_data, vertex_count) = monitor.layout.vertices(crects, width, height);

        // SAFETY: one self-contained render pass on the current context;
        // the source binding is released before the function returns.
        unsafe {
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D, Some(monitor.bmp_texture));
            self.backend.bind_tex_image(monitor.image);

            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.fbo));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(monitor.enc_texture),
                0,
            );

            gl.use_program(Some(shader.program));

            let vao = gl.create_vertex_array().map_err(GpuError::Gl)?;
            let vbo = gl.create_buffer().map_err(GpuError::Gl)?;
            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, as_bytes(&vertex_data), glow::STATIC_DRAW);
            gl.enable_vertex_attrib_array(0);
            gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, 8, 0);

            if let Some(loc) = shader.tex_size.as_ref() {
                gl.uniform_2_f32(Some(loc), monitor.width as f32, monitor.height as f32);
            }

            let vp = monitor.viewport;
            gl.viewport(vp.x as i32, vp.y as i32, vp.w as i32, vp.h as i32);
            gl.draw_arrays(glow::TRIANGLES, 0, vertex_count);

            gl.bind_buffer(glow::ARRAY_BUFFER, None);
            gl.bind_vertex_array(None);
            gl.delete_buffer(vbo);
            gl.delete_vertex_array(vao);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            self.backend.release_tex_image(monitor.image);
            gl.bind_texture(glow::TEXTURE_2D, None);
            gl.use_program(None);

            // the encoder reads the texture out-of-band; fence first
            self.x11.flush();
            gl.finish();
        }

        let force_key = monitor.pending_key_frames > 0;
        let frame = self.encoders.encode(
            &mut monitor.encoder,
            &self.backend,
            monitor.enc_texture.0.get(),
            dst,
            force_key,
        )?;
        if force_key && frame.kind == FrameKind::Key {
            monitor.pending_key_frames -= 1;
        }
        if frame.len == 0 {
            warn!(mon_id, "encoder produced an empty bitstream");
        }
        Ok(frame.len)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        self.delete_all_monitors();
        self.shaders.destroy(&self.gl);
        // SAFETY: context is still current; fbo belongs to it.
        unsafe {
            self.gl.delete_framebuffer(self.fbo);
        }
    }
}

fn as_bytes(data: &[f32]) -> &[u8] {
    // SAFETY: f32 has no padding and no invalid byte patterns.
    unsafe {
        std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_wraps_at_sixteen() {
        assert_eq!(monitor_slot(0), 0);
        assert_eq!(monitor_slot(15), 15);
        assert_eq!(monitor_slot(16), 0);
        assert_eq!(monitor_slot(33), 1);
    }

    #[test]
    fn vertex_bytes_cast() {
        let data = [1.0f32, -1.0];
        let bytes = as_bytes(&data);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_ne_bytes());
    }

    fn live_config() -> HelperConfig {
        HelperConfig {
            xorg_fd: -1,
            xrdp_fd: -1,
            drm_device: "/dev/dri/renderD128".into(),
            yami_lib: None,
        }
    }

    #[test]
    #[ignore = "requires an X server and a GPU"]
    fn context_initialises_against_live_server() {
        let gpu = GpuContext::init(&live_config()).unwrap();
        assert!(gpu.connection_fd() >= 0);
    }

    #[test]
    #[ignore = "requires an X server and a GPU"]
    fn monitor_create_twice_reports_conflict() {
        let mut gpu = GpuContext::init(&live_config()).unwrap();
        gpu.create_monitor(1920, 1080, 0x1234_5678, 1, 0).unwrap();
        assert!(matches!(
            gpu.create_monitor(1920, 1080, 0x1234_5678, 1, 0),
            Err(GpuError::MonitorExists { slot: 0 })
        ));
        gpu.delete_all_monitors();
        // the slot is reusable after deletion
        gpu.create_monitor(1920, 1080, 0x1234_5678, 1, 0).unwrap();
    }
}
