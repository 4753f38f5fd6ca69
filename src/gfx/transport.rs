//! Segmented transport over the dynamic virtual channel
//!
//! Outbound GFX messages are wrapped in the RDP8 segmented-data envelope
//! before they hit the channel:
//!
//! ```text
//! [0xE0]   segmented descriptor = SINGLE
//! [0x04]   bulk header = PACKET_COMPR_TYPE_RDP8 (uncompressed)
//! [RDPGFX_HEADER + payload ...]
//! ```
//!
//! The DVC layer caps a write at 1500 bytes: anything larger leaves as one
//! `data_first` chunk announcing the total followed by `data` chunks.
//! Inbound, the mirror image: a `data_first` opens a reassembly buffer of
//! exactly the announced size, and the buffer running out of capacity is the
//! completion sentinel.

use bytes::{Bytes, BytesMut};
use tracing::warn;

use super::pdu::GfxPdu;
use super::GfxError;

/// `RDP_SEGMENTED_DATA` descriptor for a single unfragmented segment.
pub const SEGMENT_SINGLE: u8 = 0xE0;

/// `RDP8_BULK_ENCODED_DATA` header: RDP8 compression type, no flags.
pub const BULK_COMPR_TYPE_RDP8: u8 = 0x04;

/// Largest chunk the DVC layer carries in one write.
pub const MAX_CHUNK: usize = 1500;

/// Channel writes provided by the enclosing RDP server.
///
/// Implementations forward to `drdynvc` data-first/data PDUs; PDU ordering
/// on the wire follows call ordering.
pub trait ChannelOutput {
    fn send_data_first(
        &mut self,
        channel_id: u32,
        total: usize,
        chunk: &[u8],
    ) -> std::io::Result<()>;

    fn send_data(&mut self, channel_id: u32, chunk: &[u8]) -> std::io::Result<()>;
}

/// Envelope a command for the wire.
pub fn wrap_pdu(pdu: &GfxPdu) -> BytesMut {
    let mut out = BytesMut::with_capacity(2 + pdu.size());
    out.extend_from_slice(&[SEGMENT_SINGLE, BULK_COMPR_TYPE_RDP8]);
    pdu.encode(&mut out);
    out
}

/// Write an enveloped message, fragmenting past [`MAX_CHUNK`].
pub fn send_wrapped(
    out: &mut dyn ChannelOutput,
    channel_id: u32,
    wrapped: &[u8],
) -> Result<(), GfxError> {
    if wrapped.len() <= MAX_CHUNK {
        out.send_data(channel_id, wrapped)?;
        return Ok(());
    }

    let mut chunks = wrapped.chunks(MAX_CHUNK);
    // chunks() over a non-empty slice always yields at least one item
    let first = chunks.next().unwrap_or(&[]);
    out.send_data_first(channel_id, wrapped.len(), first)?;
    for chunk in chunks {
        out.send_data(channel_id, chunk)?;
    }
    Ok(())
}

/// Inbound fragment accumulator.
///
/// `data_first` announces the total size; subsequent `data` chunks fill the
/// buffer. Completion is detected by exhausted capacity, not by counting
/// fragments.
#[derive(Debug, Default)]
pub struct Reassembly {
    buf: Option<BytesMut>,
    total: usize,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reassembly is open and waiting for more `data` chunks.
    pub fn is_active(&self) -> bool {
        self.buf.is_some()
    }

    /// Open a buffer of `total` bytes seeded with the first chunk.
    ///
    /// An already-open reassembly is discarded; the previous sender cannot
    /// complete anyway once the peer restarted the sequence.
    pub fn begin(&mut self, total: usize, chunk: &[u8]) -> Result<Option<Bytes>, GfxError> {
        if self.buf.is_some() {
            warn!("data_first while reassembly in progress, dropping partial buffer");
        }
        if chunk.len() > total {
            return Err(GfxError::ReassemblyOverflow {
                cap: total,
                got: chunk.len(),
            });
        }
        let mut buf = BytesMut::with_capacity(total);
        buf.extend_from_slice(chunk);
        self.buf = Some(buf);
        self.total = total;
        Ok(self.take_if_complete())
    }

    /// Append a chunk; returns the full message once capacity is exhausted.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Bytes>, GfxError> {
        let buf = match self.buf.as_mut() {
            Some(buf) => buf,
            // no data_first in flight: the chunk is a complete message
            None => return Ok(Some(Bytes::copy_from_slice(chunk))),
        };
        if buf.len() + chunk.len() > self.total {
            let got = buf.len() + chunk.len();
            self.buf = None;
            return Err(GfxError::ReassemblyOverflow {
                cap: self.total,
                got,
            });
        }
        buf.extend_from_slice(chunk);
        Ok(self.take_if_complete())
    }

    fn take_if_complete(&mut self) -> Option<Bytes> {
        if self.buf.as_ref().is_some_and(|b| b.len() == self.total) {
            self.buf.take().map(BytesMut::freeze)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CapturedWrites {
        first: Option<(u32, usize, Vec<u8>)>,
        writes: Vec<(u32, Vec<u8>)>,
    }

    impl ChannelOutput for CapturedWrites {
        fn send_data_first(
            &mut self,
            channel_id: u32,
            total: usize,
            chunk: &[u8],
        ) -> std::io::Result<()> {
            self.first = Some((channel_id, total, chunk.to_vec()));
            Ok(())
        }

        fn send_data(&mut self, channel_id: u32, chunk: &[u8]) -> std::io::Result<()> {
            self.writes.push((channel_id, chunk.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn small_message_single_write() {
        let mut out = CapturedWrites::default();
        let wrapped = wrap_pdu(&GfxPdu::EndFrame { frame_id: 1 });
        send_wrapped(&mut out, 9, &wrapped).unwrap();
        assert!(out.first.is_none());
        assert_eq!(out.writes.len(), 1);
        assert_eq!(out.writes[0].0, 9);
        assert_eq!(out.writes[0].1, wrapped.to_vec());
        assert_eq!(&out.writes[0].1[..2], &[SEGMENT_SINGLE, BULK_COMPR_TYPE_RDP8]);
    }

    #[test]
    fn three_kilobyte_message_fragments_at_1500() {
        // 744 points: 2 envelope + 8 header + 14 fixed + 744*4 = exactly 3000
        let pdu = GfxPdu::SurfaceToSurface {
            src_id: 0,
            dst_id: 1,
            src_rect: crate::gfx::GfxRect { x1: 0, y1: 0, x2: 16, y2: 16 },
            points: (0..744)
                .map(|i| crate::gfx::GfxPoint { x: i, y: i })
                .collect(),
        };
        let wrapped = wrap_pdu(&pdu);
        assert_eq!(wrapped.len(), 3000);

        let mut out = CapturedWrites::default();
        send_wrapped(&mut out, 4, &wrapped).unwrap();

        let (chan, total, first) = out.first.expect("data_first");
        assert_eq!(chan, 4);
        assert_eq!(total, 3000);
        assert_eq!(first.len(), 1500);
        assert_eq!(out.writes.len(), 1);
        assert_eq!(out.writes[0].1.len(), 1500);

        let mut rejoined = first;
        rejoined.extend_from_slice(&out.writes[0].1);
        assert_eq!(rejoined, wrapped.to_vec());
    }

    #[test]
    fn reassembly_completes_on_exact_capacity() {
        let payload: Vec<u8> = (0..=255).cycle().take(4000).map(|b| b as u8).collect();
        let mut re = Reassembly::new();
        assert!(re.begin(4000, &payload[..1500]).unwrap().is_none());
        assert!(re.is_active());
        assert!(re.push(&payload[1500..3000]).unwrap().is_none());
        let done = re.push(&payload[3000..]).unwrap().expect("complete");
        assert_eq!(&done[..], &payload[..]);
        assert!(!re.is_active());
    }

    #[test]
    fn single_shot_data_passes_through() {
        let mut re = Reassembly::new();
        let done = re.push(b"hello").unwrap().expect("complete");
        assert_eq!(&done[..], b"hello");
    }

    #[test]
    fn overflow_is_rejected_and_clears() {
        let mut re = Reassembly::new();
        assert!(re.begin(10, &[0; 8]).unwrap().is_none());
        assert!(matches!(
            re.push(&[0; 8]),
            Err(GfxError::ReassemblyOverflow { cap: 10, got: 16 })
        ));
        assert!(!re.is_active());
    }

    #[test]
    fn reassembly_split_points_do_not_matter() {
        let payload: Vec<u8> = (0u16..2048).map(|v| (v % 251) as u8).collect();
        for split in [1usize, 7, 100, 1024, 2047] {
            let mut re = Reassembly::new();
            assert!(re.begin(payload.len(), &payload[..split]).unwrap().is_none());
            let mut result = None;
            let mut off = split;
            // feed the rest one odd-sized piece at a time
            while off < payload.len() {
                let end = (off + 313).min(payload.len());
                result = re.push(&payload[off..end]).unwrap();
                off = end;
            }
            assert_eq!(&result.expect("complete")[..], &payload[..]);
        }
    }
}
