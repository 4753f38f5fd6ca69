//! GFX channel session state
//!
//! One [`GfxSession`] exists per opened `Microsoft::Windows::RDS::Graphics`
//! channel. It consumes the channel's `data_first`/`data` callbacks, answers
//! the client's capability advertisement, pushes the surface topology once
//! negotiation settles, and exposes fill/copy/frame emission as operations
//! for the encoder side of the server.
//!
//! Frame ids are strictly monotone: the counter is pre-incremented for each
//! `STARTFRAME` and the matching `ENDFRAME` reuses the value. The session
//! refuses to open a second frame while one is outstanding.

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::pdu::{CapsSet, GfxPdu, GfxPoint, GfxRect, CAPVERSION_104, PIXEL_FORMAT_XRGB};
use super::transport::{send_wrapped, wrap_pdu, ChannelOutput, Reassembly};
use super::GfxError;

/// One logical monitor the session maps onto an output surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorLayout {
    pub surface_id: u16,
    pub width: u16,
    pub height: u16,
    /// Output origin in desktop coordinates.
    pub x: u32,
    pub y: u32,
}

/// Client frame-acknowledge counters, advisory flow control only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckCounters {
    pub queue_depth: u32,
    pub last_acked_frame_id: u32,
    pub total_frames_decoded: u32,
}

/// State machine for one GFX dynamic virtual channel.
pub struct GfxSession {
    channel_id: u32,
    monitors: Vec<MonitorLayout>,

    frame_id: u32,
    open_frame: Option<u32>,

    caps_version: Option<u32>,
    acks: AckCounters,

    reassembly: Reassembly,
}

impl GfxSession {
    pub fn new(channel_id: u32, monitors: Vec<MonitorLayout>) -> Self {
        Self {
            channel_id,
            monitors,
            frame_id: 0,
            open_frame: None,
            caps_version: None,
            acks: AckCounters::default(),
            reassembly: Reassembly::new(),
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Negotiation finished; surfaces exist and drawing may start.
    pub fn is_ready(&self) -> bool {
        self.caps_version.is_some()
    }

    pub fn caps_version(&self) -> Option<u32> {
        self.caps_version
    }

    pub fn acks(&self) -> AckCounters {
        self.acks
    }

    /// Id of the last `STARTFRAME` emitted.
    pub fn last_frame_id(&self) -> u32 {
        self.frame_id
    }

    // -------------------------------------------------------------------------
    // DVC entry points
    // -------------------------------------------------------------------------

    pub fn open_response(&mut self, creation_status: i32) {
        info!(
            channel_id = self.channel_id,
            creation_status, "gfx channel open"
        );
    }

    pub fn close_response(&mut self) {
        info!(channel_id = self.channel_id, "gfx channel closed");
    }

    /// First fragment of a segmented message; `total` is the final size.
    pub fn data_first(
        &mut self,
        out: &mut dyn ChannelOutput,
        total: usize,
        chunk: &[u8],
    ) -> Result<(), GfxError> {
        if let Some(full) = self.reassembly.begin(total, chunk)? {
            return self.process(out, &full);
        }
        Ok(())
    }

    /// Follow-up fragment, or a complete single-shot message.
    pub fn data(&mut self, out: &mut dyn ChannelOutput, chunk: &[u8]) -> Result<(), GfxError> {
        if let Some(full) = self.reassembly.push(chunk)? {
            return self.process(out, &full);
        }
        Ok(())
    }

    fn process(&mut self, out: &mut dyn ChannelOutput, buf: &Bytes) -> Result<(), GfxError> {
        let mut src = &buf[..];
        while src.len() >= super::pdu::HEADER_SIZE {
            match GfxPdu::decode(&mut src)? {
                GfxPdu::CapsAdvertise { caps } => self.handle_caps_advertise(out, &caps)?,
                GfxPdu::FrameAcknowledge {
                    queue_depth,
                    frame_id,
                    total_frames_decoded,
                } => {
                    trace!(queue_depth, frame_id, total_frames_decoded, "frame ack");
                    self.acks = AckCounters {
                        queue_depth,
                        last_acked_frame_id: frame_id,
                        total_frames_decoded,
                    };
                }
                GfxPdu::Unknown { cmd_id } => {
                    debug!(cmd_id, "skipping unhandled gfx command");
                }
                other => {
                    // client-to-server traffic should not carry server commands
                    warn!(?other, "unexpected gfx command from client");
                }
            }
        }
        Ok(())
    }

    fn handle_caps_advertise(
        &mut self,
        out: &mut dyn ChannelOutput,
        caps: &[CapsSet],
    ) -> Result<(), GfxError> {
        debug!(sets = caps.len(), "caps advertise");
        for set in caps {
            if set.version == CAPVERSION_104 && set.flags == 0 && self.caps_version.is_none() {
                info!(version = format_args!("{:#010x}", set.version), "caps confirmed");
                self.send(
                    out,
                    &GfxPdu::CapsConfirm {
                        version: set.version,
                        flags: set.flags,
                    },
                )?;
                self.caps_version = Some(set.version);
                self.create_surface_topology(out)?;
            }
        }
        Ok(())
    }

    /// Emit `CREATESURFACE` + `MAPSURFACETOOUTPUT` for every monitor.
    fn create_surface_topology(&mut self, out: &mut dyn ChannelOutput) -> Result<(), GfxError> {
        for mon in self.monitors.clone() {
            self.create_surface(out, mon.surface_id, mon.width, mon.height)?;
            self.map_surface_to_output(out, mon.surface_id, mon.x, mon.y)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Outbound operations
    // -------------------------------------------------------------------------

    pub fn create_surface(
        &mut self,
        out: &mut dyn ChannelOutput,
        surface_id: u16,
        width: u16,
        height: u16,
    ) -> Result<(), GfxError> {
        self.send(
            out,
            &GfxPdu::CreateSurface {
                surface_id,
                width,
                height,
                pixel_format: PIXEL_FORMAT_XRGB,
            },
        )
    }

    pub fn map_surface_to_output(
        &mut self,
        out: &mut dyn ChannelOutput,
        surface_id: u16,
        x: u32,
        y: u32,
    ) -> Result<(), GfxError> {
        self.send(out, &GfxPdu::MapSurfaceToOutput { surface_id, x, y })
    }

    /// Open frame `N`; returns the new frame id.
    pub fn start_frame(
        &mut self,
        out: &mut dyn ChannelOutput,
        timestamp: u32,
    ) -> Result<u32, GfxError> {
        self.ensure_ready()?;
        if let Some(frame_id) = self.open_frame {
            return Err(GfxError::FramePending { frame_id });
        }
        self.frame_id = self.frame_id.wrapping_add(1);
        let frame_id = self.frame_id;
        self.send(out, &GfxPdu::StartFrame { timestamp, frame_id })?;
        self.open_frame = Some(frame_id);
        Ok(frame_id)
    }

    /// Close the open frame; returns its id.
    pub fn end_frame(&mut self, out: &mut dyn ChannelOutput) -> Result<u32, GfxError> {
        let frame_id = self.open_frame.take().ok_or(GfxError::NoOpenFrame)?;
        self.send(out, &GfxPdu::EndFrame { frame_id })?;
        Ok(frame_id)
    }

    pub fn solid_fill(
        &mut self,
        out: &mut dyn ChannelOutput,
        surface_id: u16,
        color: u32,
        rects: &[GfxRect],
    ) -> Result<(), GfxError> {
        self.ensure_ready()?;
        self.send(
            out,
            &GfxPdu::SolidFill {
                surface_id,
                color,
                rects: rects.to_vec(),
            },
        )
    }

    pub fn surface_to_surface(
        &mut self,
        out: &mut dyn ChannelOutput,
        src_id: u16,
        dst_id: u16,
        src_rect: GfxRect,
        points: &[GfxPoint],
    ) -> Result<(), GfxError> {
        self.ensure_ready()?;
        self.send(
            out,
            &GfxPdu::SurfaceToSurface {
                src_id,
                dst_id,
                src_rect,
                points: points.to_vec(),
            },
        )
    }

    fn ensure_ready(&self) -> Result<(), GfxError> {
        if self.caps_version.is_none() {
            return Err(GfxError::NotReady);
        }
        Ok(())
    }

    fn send(&mut self, out: &mut dyn ChannelOutput, pdu: &GfxPdu) -> Result<(), GfxError> {
        let wrapped = wrap_pdu(pdu);
        send_wrapped(out, self.channel_id, &wrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    /// Captures channel writes and re-decodes them for assertions.
    #[derive(Default)]
    struct WireLog {
        messages: Vec<Vec<u8>>,
        pending: Option<(usize, Vec<u8>)>,
    }

    impl WireLog {
        fn decoded(&self) -> Vec<GfxPdu> {
            self.messages
                .iter()
                .map(|m| {
                    assert_eq!(m[0], crate::gfx::transport::SEGMENT_SINGLE);
                    assert_eq!(m[1], crate::gfx::transport::BULK_COMPR_TYPE_RDP8);
                    let mut body = &m[2..];
                    let pdu = GfxPdu::decode(&mut body).expect("decode emitted pdu");
                    assert!(body.is_empty());
                    pdu
                })
                .collect()
        }
    }

    impl ChannelOutput for WireLog {
        fn send_data_first(
            &mut self,
            _channel_id: u32,
            total: usize,
            chunk: &[u8],
        ) -> std::io::Result<()> {
            self.pending = Some((total, chunk.to_vec()));
            Ok(())
        }

        fn send_data(&mut self, _channel_id: u32, chunk: &[u8]) -> std::io::Result<()> {
            match self.pending.take() {
                Some((total, mut buf)) => {
                    buf.extend_from_slice(chunk);
                    if buf.len() == total {
                        self.messages.push(buf);
                    } else {
                        self.pending = Some((total, buf));
                    }
                }
                None => self.messages.push(chunk.to_vec()),
            }
            Ok(())
        }
    }

    fn advertise_bytes(version: u32, flags: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        GfxPdu::CapsAdvertise {
            caps: vec![CapsSet { version, flags }],
        }
        .encode(&mut buf);
        buf.to_vec()
    }

    fn negotiated_session(wire: &mut WireLog) -> GfxSession {
        let mut session = GfxSession::new(
            1,
            vec![MonitorLayout {
                surface_id: 0,
                width: 1920,
                height: 1080,
                x: 0,
                y: 0,
            }],
        );
        session
            .data(wire, &advertise_bytes(CAPVERSION_104, 0))
            .unwrap();
        session
    }

    #[test]
    fn caps_negotiation_confirms_and_builds_topology() {
        let mut wire = WireLog::default();
        let session = negotiated_session(&mut wire);

        assert!(session.is_ready());
        assert_eq!(session.caps_version(), Some(CAPVERSION_104));

        let pdus = wire.decoded();
        assert_eq!(
            pdus[0],
            GfxPdu::CapsConfirm {
                version: CAPVERSION_104,
                flags: 0
            }
        );
        assert_eq!(
            pdus[1],
            GfxPdu::CreateSurface {
                surface_id: 0,
                width: 1920,
                height: 1080,
                pixel_format: PIXEL_FORMAT_XRGB,
            }
        );
        assert_eq!(
            pdus[2],
            GfxPdu::MapSurfaceToOutput {
                surface_id: 0,
                x: 0,
                y: 0
            }
        );
    }

    #[test]
    fn unsupported_version_is_ignored_without_error() {
        let mut wire = WireLog::default();
        let mut session = GfxSession::new(1, vec![]);
        session
            .data(&mut wire, &advertise_bytes(0x000A_0300, 0))
            .unwrap();
        assert!(!session.is_ready());
        assert!(wire.messages.is_empty());
    }

    #[test]
    fn nonzero_flags_are_ignored() {
        let mut wire = WireLog::default();
        let mut session = GfxSession::new(1, vec![]);
        session
            .data(&mut wire, &advertise_bytes(CAPVERSION_104, 2))
            .unwrap();
        assert!(!session.is_ready());
        assert!(wire.messages.is_empty());
    }

    #[test]
    fn frame_ack_updates_counters() {
        let mut wire = WireLog::default();
        let mut session = GfxSession::new(1, vec![]);

        let mut buf = BytesMut::new();
        GfxPdu::FrameAcknowledge {
            queue_depth: 2,
            frame_id: 7,
            total_frames_decoded: 5,
        }
        .encode(&mut buf);
        session.data(&mut wire, &buf).unwrap();

        assert_eq!(
            session.acks(),
            AckCounters {
                queue_depth: 2,
                last_acked_frame_id: 7,
                total_frames_decoded: 5,
            }
        );
    }

    #[test]
    fn frames_are_paired_and_monotone() {
        let mut wire = WireLog::default();
        let mut session = negotiated_session(&mut wire);

        let first = session.start_frame(&mut wire, 100).unwrap();
        assert_eq!(first, 1);
        // second start before end must fail
        assert!(matches!(
            session.start_frame(&mut wire, 101),
            Err(GfxError::FramePending { frame_id: 1 })
        ));
        assert_eq!(session.end_frame(&mut wire).unwrap(), 1);
        assert!(matches!(
            session.end_frame(&mut wire),
            Err(GfxError::NoOpenFrame)
        ));
        let second = session.start_frame(&mut wire, 102).unwrap();
        assert_eq!(second, 2);
        session.end_frame(&mut wire).unwrap();

        let pdus = wire.decoded();
        let frames: Vec<&GfxPdu> = pdus
            .iter()
            .filter(|p| matches!(p, GfxPdu::StartFrame { .. } | GfxPdu::EndFrame { .. }))
            .collect();
        assert_eq!(
            frames,
            vec![
                &GfxPdu::StartFrame { timestamp: 100, frame_id: 1 },
                &GfxPdu::EndFrame { frame_id: 1 },
                &GfxPdu::StartFrame { timestamp: 102, frame_id: 2 },
                &GfxPdu::EndFrame { frame_id: 2 },
            ]
        );
    }

    #[test]
    fn drawing_before_negotiation_is_refused() {
        let mut wire = WireLog::default();
        let mut session = GfxSession::new(1, vec![]);
        assert!(matches!(
            session.solid_fill(&mut wire, 0, 0, &[]),
            Err(GfxError::NotReady)
        ));
        assert!(matches!(
            session.start_frame(&mut wire, 0),
            Err(GfxError::NotReady)
        ));
    }

    #[test]
    fn reassembled_advertise_matches_single_shot() {
        // same advertise delivered whole and in three fragments
        let bytes = advertise_bytes(CAPVERSION_104, 0);

        let mut wire_whole = WireLog::default();
        let mut whole = GfxSession::new(1, vec![]);
        whole.data(&mut wire_whole, &bytes).unwrap();

        let mut wire_split = WireLog::default();
        let mut split = GfxSession::new(1, vec![]);
        split.data_first(&mut wire_split, bytes.len(), &bytes[..5]).unwrap();
        split.data(&mut wire_split, &bytes[5..9]).unwrap();
        split.data(&mut wire_split, &bytes[9..]).unwrap();

        assert_eq!(whole.caps_version(), split.caps_version());
        assert_eq!(wire_whole.messages, wire_split.messages);
    }

    #[test]
    fn truncated_pdu_reports_error_but_session_survives() {
        let mut wire = WireLog::default();
        let mut session = GfxSession::new(1, vec![]);

        let mut buf = BytesMut::new();
        GfxPdu::FrameAcknowledge {
            queue_depth: 0,
            frame_id: 1,
            total_frames_decoded: 1,
        }
        .encode(&mut buf);
        let truncated = &buf[..buf.len() - 2];
        assert!(session.data(&mut wire, truncated).is_err());

        // next well-formed PDU still lands
        session
            .data(&mut wire, &advertise_bytes(CAPVERSION_104, 0))
            .unwrap();
        assert!(session.is_ready());
    }
}
