//! Display-side message payloads
//!
//! The display server batches sub-records inside its outer frames. Two
//! outer types matter here: the paint batch (type 3) whose sub-record 61
//! names a dirty region in a shared segment, and the control batch
//! (type 100) that manages per-monitor GPU state. Everything else passes
//! through opaque.

use bytes::Buf;

use crate::gpu::Rect;

use super::RelayError;

/// Outer frame class: bitmap-update batch.
pub const MSG_PAINT: u16 = 3;
/// Outer frame class: control batch, consumed by the helper.
pub const MSG_CONTROL: u16 = 100;

/// Paint sub-record: dirty region in a shared pixmap.
pub const SUB_PAINT_DIRTY_SHMEM: u16 = 61;
/// Control sub-record: delete all per-monitor GPU state.
pub const SUB_CONTROL_DELETE_ALL: u16 = 1;
/// Control sub-record: create a monitor.
pub const SUB_CONTROL_CREATE: u16 = 2;

/// `[type:u16le][num:u16le][size:u32le]` outer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OuterHeader {
    pub msg_type: u16,
    pub num: u16,
    pub size: u32,
}

/// Split a complete frame into its header and payload.
pub fn parse_outer(frame: &[u8]) -> Result<(OuterHeader, &[u8]), RelayError> {
    if frame.len() < 8 {
        return Err(RelayError::Malformed { what: "outer header" });
    }
    let mut header = &frame[..8];
    let msg_type = header.get_u16_le();
    let num = header.get_u16_le();
    let size = header.get_u32_le();
    if frame.len() < 8 + size as usize {
        return Err(RelayError::Malformed { what: "outer body" });
    }
    Ok((OuterHeader { msg_type, num, size }, &frame[8..8 + size as usize]))
}

/// Walks `[sub_type:u16le][sub_size:u16le][body: sub_size - 4]` records.
pub struct SubRecords<'a> {
    buf: &'a [u8],
    remaining: u16,
}

impl<'a> SubRecords<'a> {
    pub fn new(payload: &'a [u8], count: u16) -> Self {
        Self {
            buf: payload,
            remaining: count,
        }
    }
}

impl<'a> Iterator for SubRecords<'a> {
    type Item = Result<(u16, &'a [u8]), RelayError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.buf.len() < 4 {
            self.remaining = 0;
            return Some(Err(RelayError::Malformed { what: "sub header" }));
        }
        let mut header = &self.buf[..4];
        let sub_type = header.get_u16_le();
        let sub_size = header.get_u16_le() as usize;
        if sub_size < 4 || self.buf.len() < sub_size {
            self.remaining = 0;
            return Some(Err(RelayError::Malformed { what: "sub body" }));
        }
        let body = &self.buf[4..sub_size];
        self.buf = &self.buf[sub_size..];
        Some(Ok((sub_type, body)))
    }
}

/// Sub-record 61: dirty region inside a shared pixmap.
///
/// ```text
/// [num_drects:u16le][drects: 8 x num_drects]      (ignored)
/// [num_crects:u16le][crects: 4 x u16le each]
/// [flags:u32le][frame_id:u32le]                   (frame_id ignored)
/// [shmem_id:u32le][shmem_offset:u32le]
/// [width:u16le][height:u16le]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRegion {
    pub crects: Vec<Rect>,
    pub flags: u32,
    pub shmem_id: u32,
    pub shmem_offset: u32,
    pub width: u16,
    pub height: u16,
}

impl DirtyRegion {
    pub fn parse(mut body: &[u8]) -> Result<Self, RelayError> {
        let too_short = RelayError::Malformed { what: "dirty region" };

        if body.len() < 2 {
            return Err(too_short);
        }
        let num_drects = body.get_u16_le() as usize;
        if body.len() < num_drects * 8 + 2 {
            return Err(RelayError::Malformed { what: "dirty region" });
        }
        body.advance(num_drects * 8);

        let num_crects = body.get_u16_le() as usize;
        if body.len() < num_crects * 8 + 20 {
            return Err(RelayError::Malformed { what: "dirty region" });
        }
        let crects = (0..num_crects)
            .map(|_| Rect {
                x: body.get_u16_le(),
                y: body.get_u16_le(),
                w: body.get_u16_le(),
                h: body.get_u16_le(),
            })
            .collect();

        let flags = body.get_u32_le();
        body.advance(4); /* frame_id */
        Ok(Self {
            crects,
            flags,
            shmem_id: body.get_u32_le(),
            shmem_offset: body.get_u32_le(),
            width: body.get_u16_le(),
            height: body.get_u16_le(),
        })
    }
}

/// Control sub-record 2: create a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateMonitor {
    pub width: u16,
    pub height: u16,
    pub magic: u32,
    pub con_id: u32,
    pub mon_id: u32,
}

impl CreateMonitor {
    pub fn parse(mut body: &[u8]) -> Result<Self, RelayError> {
        if body.len() < 16 {
            return Err(RelayError::Malformed { what: "create monitor" });
        }
        Ok(Self {
            width: body.get_u16_le(),
            height: body.get_u16_le(),
            magic: body.get_u32_le(),
            con_id: body.get_u32_le(),
            mon_id: body.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn dirty_region_bytes(crects: &[Rect], flags: u32, shmem_id: u32, offset: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u16_le(1); /* one drect, ignored */
        body.put_slice(&[0u8; 8]);
        body.put_u16_le(crects.len() as u16);
        for r in crects {
            body.put_u16_le(r.x);
            body.put_u16_le(r.y);
            body.put_u16_le(r.w);
            body.put_u16_le(r.h);
        }
        body.put_u32_le(flags);
        body.put_u32_le(42); /* frame_id, ignored */
        body.put_u32_le(shmem_id);
        body.put_u32_le(offset);
        body.put_u16_le(1920);
        body.put_u16_le(1080);
        body
    }

    #[test]
    fn outer_header_parses() {
        let mut frame = Vec::new();
        frame.put_u16_le(3);
        frame.put_u16_le(2);
        frame.put_u32_le(4);
        frame.put_u32_le(0xDEAD_BEEF);
        let (header, payload) = parse_outer(&frame).unwrap();
        assert_eq!(header, OuterHeader { msg_type: 3, num: 2, size: 4 });
        assert_eq!(payload.len(), 4);
    }

    #[test]
    fn outer_body_shorter_than_size_is_malformed() {
        let mut frame = Vec::new();
        frame.put_u16_le(3);
        frame.put_u16_le(1);
        frame.put_u32_le(100);
        assert!(parse_outer(&frame).is_err());
    }

    #[test]
    fn sub_records_walk_by_declared_size() {
        let mut payload = Vec::new();
        payload.put_u16_le(61);
        payload.put_u16_le(4 + 3);
        payload.put_slice(b"abc");
        payload.put_u16_le(7);
        payload.put_u16_le(4);
        let records: Vec<_> = SubRecords::new(&payload, 2).collect::<Result<_, _>>().unwrap();
        assert_eq!(records[0], (61, &b"abc"[..]));
        assert_eq!(records[1], (7, &b""[..]));
    }

    #[test]
    fn sub_record_overrun_is_malformed() {
        let mut payload = Vec::new();
        payload.put_u16_le(61);
        payload.put_u16_le(50); /* body claims more than present */
        payload.put_slice(b"xy");
        let mut iter = SubRecords::new(&payload, 1);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn dirty_region_parses() {
        let crects = [
            Rect { x: 0, y: 0, w: 16, h: 16 },
            Rect { x: 32, y: 64, w: 128, h: 256 },
        ];
        let body = dirty_region_bytes(&crects, 0, 9001, 4096);
        let parsed = DirtyRegion::parse(&body).unwrap();
        assert_eq!(parsed.crects, crects.to_vec());
        assert_eq!(parsed.flags, 0);
        assert_eq!(parsed.shmem_id, 9001);
        assert_eq!(parsed.shmem_offset, 4096);
        assert_eq!((parsed.width, parsed.height), (1920, 1080));
    }

    #[test]
    fn dirty_region_truncated_rects_rejected() {
        let body = dirty_region_bytes(&[Rect { x: 0, y: 0, w: 1, h: 1 }], 0, 1, 0);
        assert!(DirtyRegion::parse(&body[..body.len() - 6]).is_err());
    }

    #[test]
    fn create_monitor_parses() {
        let mut body = Vec::new();
        body.put_u16_le(1920);
        body.put_u16_le(1080);
        body.put_u32_le(0x5AFE_C0DE);
        body.put_u32_le(7);
        body.put_u32_le(2);
        let parsed = CreateMonitor::parse(&body).unwrap();
        assert_eq!(
            parsed,
            CreateMonitor {
                width: 1920,
                height: 1080,
                magic: 0x5AFE_C0DE,
                con_id: 7,
                mon_id: 2,
            }
        );
    }
}
