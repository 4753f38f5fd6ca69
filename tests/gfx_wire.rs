//! RDPEGFX wire-level integration tests
//!
//! Drives a [`GfxSession`] through a mock DVC transport and checks the
//! emitted byte streams against the documented layouts.

use bytes::{Buf, BytesMut};

use rdp_gfx_helper::gfx::pdu::{self, GfxPdu};
use rdp_gfx_helper::gfx::transport::{BULK_COMPR_TYPE_RDP8, MAX_CHUNK, SEGMENT_SINGLE};
use rdp_gfx_helper::gfx::{CapsSet, ChannelOutput, GfxPoint, GfxRect, GfxSession, MonitorLayout, CAPVERSION_104};

/// Records every DVC write verbatim.
#[derive(Default)]
struct Dvc {
    data_first: Vec<(usize, Vec<u8>)>,
    data: Vec<Vec<u8>>,
}

impl ChannelOutput for Dvc {
    fn send_data_first(
        &mut self,
        _channel_id: u32,
        total: usize,
        chunk: &[u8],
    ) -> std::io::Result<()> {
        self.data_first.push((total, chunk.to_vec()));
        Ok(())
    }

    fn send_data(&mut self, _channel_id: u32, chunk: &[u8]) -> std::io::Result<()> {
        self.data.push(chunk.to_vec());
        Ok(())
    }
}

impl Dvc {
    /// Concatenate all writes back into one byte stream.
    fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (_, chunk) in &self.data_first {
            out.extend_from_slice(chunk);
        }
        for chunk in &self.data {
            out.extend_from_slice(chunk);
        }
        out
    }
}

fn advertise(version: u32, flags: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    GfxPdu::CapsAdvertise {
        caps: vec![CapsSet { version, flags }],
    }
    .encode(&mut buf);
    buf.to_vec()
}

fn dual_monitor_session() -> GfxSession {
    GfxSession::new(
        11,
        vec![
            MonitorLayout { surface_id: 0, width: 1920, height: 1080, x: 0, y: 0 },
            MonitorLayout { surface_id: 1, width: 1280, height: 1024, x: 1920, y: 0 },
        ],
    )
}

#[test]
fn caps_confirm_byte_layout() {
    let mut dvc = Dvc::default();
    let mut session = GfxSession::new(11, vec![]);
    session.data(&mut dvc, &advertise(CAPVERSION_104, 0)).unwrap();

    let wire = dvc.wire_bytes();
    // envelope
    assert_eq!(wire[0], SEGMENT_SINGLE);
    assert_eq!(wire[1], BULK_COMPR_TYPE_RDP8);
    // RDPGFX header
    let mut rest = &wire[2..];
    assert_eq!(rest.get_u16_le(), 0x13); /* CAPSCONFIRM */
    assert_eq!(rest.get_u16_le(), 0); /* flags */
    assert_eq!(rest.get_u32_le(), 8 + 12); /* pduLength from cmdId */
    // payload
    assert_eq!(rest.get_u32_le(), CAPVERSION_104);
    assert_eq!(rest.get_u32_le(), 4); /* capsDataLength */
    assert_eq!(rest.get_u32_le(), 0); /* flags */
    assert!(rest.is_empty());
}

#[test]
fn caps_rejection_emits_nothing() {
    let mut dvc = Dvc::default();
    let mut session = dual_monitor_session();
    session.data(&mut dvc, &advertise(0x000A_0300, 0)).unwrap();
    assert!(dvc.data.is_empty());
    assert!(dvc.data_first.is_empty());
    assert!(!session.is_ready());
}

#[test]
fn every_create_surface_is_mapped_before_any_copy() {
    let mut dvc = Dvc::default();
    let mut session = dual_monitor_session();
    session.data(&mut dvc, &advertise(CAPVERSION_104, 0)).unwrap();
    session
        .surface_to_surface(
            &mut dvc,
            0,
            1,
            GfxRect { x1: 0, y1: 0, x2: 64, y2: 64 },
            &[GfxPoint { x: 0, y: 0 }],
        )
        .unwrap();

    // decode the stream back into commands
    let mut created = Vec::new();
    let mut mapped = Vec::new();
    for message in dvc.data.iter() {
        let mut body = &message[2..];
        match GfxPdu::decode(&mut body).unwrap() {
            GfxPdu::CreateSurface { surface_id, .. } => created.push(surface_id),
            GfxPdu::MapSurfaceToOutput { surface_id, .. } => {
                // create must precede map for the same surface
                assert!(created.contains(&surface_id));
                mapped.push(surface_id);
            }
            GfxPdu::SurfaceToSurface { src_id, dst_id, .. } => {
                assert!(mapped.contains(&src_id));
                assert!(mapped.contains(&dst_id));
            }
            _ => {}
        }
    }
    assert_eq!(created, vec![0, 1]);
    assert_eq!(mapped, vec![0, 1]);
}

#[test]
fn frame_ack_counters_land_in_session() {
    let mut dvc = Dvc::default();
    let mut session = GfxSession::new(11, vec![]);

    let mut buf = BytesMut::new();
    GfxPdu::FrameAcknowledge {
        queue_depth: 2,
        frame_id: 7,
        total_frames_decoded: 5,
    }
    .encode(&mut buf);
    session.data(&mut dvc, &buf).unwrap();

    let acks = session.acks();
    assert_eq!(acks.queue_depth, 2);
    assert_eq!(acks.last_acked_frame_id, 7);
    assert_eq!(acks.total_frames_decoded, 5);
}

#[test]
fn three_kilobyte_fill_leaves_as_two_1500_byte_fragments() {
    let mut dvc = Dvc::default();
    let mut session = GfxSession::new(11, vec![]);
    session.data(&mut dvc, &advertise(CAPVERSION_104, 0)).unwrap();
    dvc.data.clear(); /* drop the negotiation traffic */

    // 2 envelope + 8 header + 8 fixed + 373 rects * 8 = 3002 wrapped bytes
    let rects: Vec<GfxRect> = (0..373)
        .map(|i| GfxRect { x1: i, y1: i, x2: i + 1, y2: i + 1 })
        .collect();
    session.solid_fill(&mut dvc, 0, 0x00FF_FFFF, &rects).unwrap();

    assert_eq!(dvc.data_first.len(), 1);
    let (total, first) = &dvc.data_first[0];
    assert_eq!(*total, 3002);
    assert_eq!(first.len(), MAX_CHUNK);
    assert_eq!(dvc.data.len(), 2);
    assert_eq!(dvc.data[0].len(), MAX_CHUNK);
    assert_eq!(dvc.data[1].len(), 2);

    // the concatenated fragments decode back to the original fill
    let wire = dvc.wire_bytes();
    assert_eq!(wire.len(), *total);
    let mut body = &wire[2..];
    match GfxPdu::decode(&mut body).unwrap() {
        GfxPdu::SolidFill { surface_id, color, rects: decoded } => {
            assert_eq!(surface_id, 0);
            assert_eq!(color, 0x00FF_FFFF);
            assert_eq!(decoded, rects);
        }
        other => panic!("unexpected pdu {other:?}"),
    }
}

#[test]
fn inbound_fragmentation_is_transparent() {
    // one advertise, delivered in every possible two-way split
    let bytes = advertise(CAPVERSION_104, 0);
    for split in 1..bytes.len() {
        let mut dvc = Dvc::default();
        let mut session = GfxSession::new(11, vec![]);
        session.data_first(&mut dvc, bytes.len(), &bytes[..split]).unwrap();
        session.data(&mut dvc, &bytes[split..]).unwrap();
        assert_eq!(session.caps_version(), Some(CAPVERSION_104), "split at {split}");
    }
}

#[test]
fn frame_ids_are_strictly_monotone_across_many_frames() {
    let mut dvc = Dvc::default();
    let mut session = GfxSession::new(11, vec![]);
    session.data(&mut dvc, &advertise(CAPVERSION_104, 0)).unwrap();

    let mut last = 0;
    for ts in 0..100u32 {
        let id = session.start_frame(&mut dvc, ts).unwrap();
        assert_eq!(id, last + 1);
        assert_eq!(session.end_frame(&mut dvc).unwrap(), id);
        last = id;
    }

    // replay the wire and re-check pairing
    let mut open: Option<u32> = None;
    let mut pairs = 0;
    for message in &dvc.data {
        let mut body = &message[2..];
        match GfxPdu::decode(&mut body).unwrap() {
            GfxPdu::StartFrame { frame_id, .. } => {
                assert!(open.is_none(), "STARTFRAME {frame_id} while a frame is open");
                open = Some(frame_id);
            }
            GfxPdu::EndFrame { frame_id } => {
                assert_eq!(open.take(), Some(frame_id));
                pairs += 1;
            }
            _ => {}
        }
    }
    assert_eq!(pairs, 100);
    assert!(open.is_none());
}

#[test]
fn header_size_constant_matches_wire() {
    let pdu = GfxPdu::EndFrame { frame_id: 1 };
    let mut buf = BytesMut::new();
    pdu.encode(&mut buf);
    assert_eq!(buf.len(), pdu::HEADER_SIZE + 4);
}
