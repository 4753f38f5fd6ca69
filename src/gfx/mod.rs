//! RDPEGFX channel endpoint (MS-RDPEGFX)
//!
//! The graphics pipeline extension rides a dynamic virtual channel named
//! `Microsoft::Windows::RDS::Graphics`. This module owns the three layers of
//! that endpoint:
//!
//! - [`pdu`] - the RDPGFX command codec (header + per-command payloads)
//! - [`transport`] - segment wrapping and DVC fragmentation/reassembly
//! - [`session`] - the per-channel state machine: capability negotiation,
//!   surface topology, frame pairing and frame-acknowledge accounting
//!
//! The enclosing RDP server provides the actual channel writes through the
//! [`transport::ChannelOutput`] trait; everything in here is synchronous
//! state driven by its `data_first`/`data` callbacks.
//!
//! # Protocol Reference
//!
//! - [MS-RDPEGFX](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpegfx/)

pub mod pdu;
pub mod session;
pub mod transport;

pub use self::pdu::{CapsSet, GfxPdu, GfxPoint, GfxRect, CAPVERSION_104};
pub use self::session::{GfxSession, MonitorLayout};
pub use self::transport::{ChannelOutput, Reassembly};

use thiserror::Error;

/// Errors of the GFX endpoint.
///
/// Protocol errors drop the current PDU and are reported to the caller; the
/// session itself stays usable, matching the channel's recovery model.
#[derive(Debug, Error)]
pub enum GfxError {
    /// A PDU body ended before its advertised fields.
    #[error("truncated {cmd} PDU")]
    Truncated { cmd: &'static str },

    /// The RDPGFX header carried a length smaller than the header itself.
    #[error("bad pduLength {pdu_length}")]
    BadLength { pdu_length: u32 },

    /// A capability entry carried an unexpected data length.
    #[error("bad capsDataLength {len}")]
    BadCapsData { len: u32 },

    /// A drawing operation was attempted before capability negotiation.
    #[error("capabilities not negotiated")]
    NotReady,

    /// `start_frame` while frame {frame_id} is still open.
    #[error("frame {frame_id} still open")]
    FramePending { frame_id: u32 },

    /// `end_frame` without an open frame.
    #[error("no open frame")]
    NoOpenFrame,

    /// A `data` chunk would overflow the announced reassembly size.
    #[error("reassembly overflow: {got} bytes into {cap}")]
    ReassemblyOverflow { cap: usize, got: usize },

    /// The channel transport failed.
    #[error("channel write failed: {0}")]
    Io(#[from] std::io::Error),
}
