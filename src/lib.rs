//! GPU-assisted MS-RDPEGFX encode helper
//!
//! This crate backs the privileged helper process that sits between an X11
//! display server and an RDP server. It relays the framed IPC between the
//! two, imports shared-memory pixmaps as GPU textures, converts RGB to the
//! encoder's YUV layout with fragment shaders, and drives a hardware H.264
//! encoder (NVENC via GL textures, or a VA-API vendor library via DMA-BUF).
//! The [`gfx`] module carries the RDPEGFX channel endpoint the enclosing
//! RDP server speaks towards the client.
//!
//! # Architecture
//!
//! ```text
//! display server ── framed IPC ──▶ relay ──▶ gpu (import + RGB→YUV) ──▶ encoder
//!                                   │             compressed bitstream ──▶ shared memory
//! rdp server     ◀── framed IPC ────┘
//!
//! rdp server ── DVC ── gfx::GfxSession ── CAPS / surfaces / frames ── client
//! ```

pub mod config;
pub mod encoder;
pub mod gfx;
pub mod gpu;
pub mod relay;

pub use config::HelperConfig;
pub use gfx::GfxSession;
pub use gpu::GpuContext;
pub use relay::Relay;
