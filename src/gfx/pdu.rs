//! RDPGFX command codec
//!
//! Every command is prefixed with the 8-byte `RDPGFX_HEADER`:
//!
//! ```text
//! [cmdId:u16le][flags:u16le][pduLength:u32le]
//! ```
//!
//! `pduLength` counts from `cmdId` inclusive to the end of the payload.
//! Byte order is little-endian throughout.

use bytes::{Buf, BufMut, BytesMut};

use super::GfxError;

pub const CMDID_SOLIDFILL: u16 = 0x0004;
pub const CMDID_SURFACETOSURFACE: u16 = 0x0005;
pub const CMDID_CREATESURFACE: u16 = 0x0009;
pub const CMDID_STARTFRAME: u16 = 0x000B;
pub const CMDID_ENDFRAME: u16 = 0x000C;
pub const CMDID_FRAMEACKNOWLEDGE: u16 = 0x000D;
pub const CMDID_MAPSURFACETOOUTPUT: u16 = 0x000F;
pub const CMDID_CAPSADVERTISE: u16 = 0x0012;
pub const CMDID_CAPSCONFIRM: u16 = 0x0013;

/// The single capability version this endpoint negotiates.
pub const CAPVERSION_104: u32 = 0x000A_0400;

/// `PIXEL_FORMAT_XRGB_8888`
pub const PIXEL_FORMAT_XRGB: u8 = 0x20;

/// Size of `RDPGFX_HEADER`.
pub const HEADER_SIZE: usize = 8;

/// Inclusive-exclusive rectangle as carried by fill and copy commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxRect {
    pub x1: u16,
    pub y1: u16,
    pub x2: u16,
    pub y2: u16,
}

/// Destination point of a surface-to-surface copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfxPoint {
    pub x: u16,
    pub y: u16,
}

/// One entry of a client `CAPSADVERTISE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsSet {
    pub version: u32,
    pub flags: u32,
}

/// A decoded (inbound) or to-be-encoded (outbound) RDPGFX command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GfxPdu {
    SolidFill {
        surface_id: u16,
        color: u32,
        rects: Vec<GfxRect>,
    },
    SurfaceToSurface {
        src_id: u16,
        dst_id: u16,
        src_rect: GfxRect,
        points: Vec<GfxPoint>,
    },
    CreateSurface {
        surface_id: u16,
        width: u16,
        height: u16,
        pixel_format: u8,
    },
    StartFrame {
        timestamp: u32,
        frame_id: u32,
    },
    EndFrame {
        frame_id: u32,
    },
    FrameAcknowledge {
        queue_depth: u32,
        frame_id: u32,
        total_frames_decoded: u32,
    },
    MapSurfaceToOutput {
        surface_id: u16,
        x: u32,
        y: u32,
    },
    CapsAdvertise {
        caps: Vec<CapsSet>,
    },
    CapsConfirm {
        version: u32,
        flags: u32,
    },
    /// Command this endpoint does not handle; the body was skipped.
    Unknown {
        cmd_id: u16,
    },
}

impl GfxPdu {
    fn payload_size(&self) -> usize {
        match self {
            GfxPdu::SolidFill { rects, .. } => 2 + 4 + 2 + rects.len() * 8,
            GfxPdu::SurfaceToSurface { points, .. } => 2 + 2 + 8 + 2 + points.len() * 4,
            GfxPdu::CreateSurface { .. } => 2 + 2 + 2 + 1,
            GfxPdu::StartFrame { .. } => 8,
            GfxPdu::EndFrame { .. } => 4,
            GfxPdu::FrameAcknowledge { .. } => 12,
            GfxPdu::MapSurfaceToOutput { .. } => 2 + 2 + 4 + 4,
            GfxPdu::CapsAdvertise { caps } => 2 + caps.len() * 12,
            GfxPdu::CapsConfirm { .. } => 12,
            GfxPdu::Unknown { .. } => 0,
        }
    }

    /// Total encoded size, header included.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload_size()
    }

    fn cmd_id(&self) -> u16 {
        match self {
            GfxPdu::SolidFill { .. } => CMDID_SOLIDFILL,
            GfxPdu::SurfaceToSurface { .. } => CMDID_SURFACETOSURFACE,
            GfxPdu::CreateSurface { .. } => CMDID_CREATESURFACE,
            GfxPdu::StartFrame { .. } => CMDID_STARTFRAME,
            GfxPdu::EndFrame { .. } => CMDID_ENDFRAME,
            GfxPdu::FrameAcknowledge { .. } => CMDID_FRAMEACKNOWLEDGE,
            GfxPdu::MapSurfaceToOutput { .. } => CMDID_MAPSURFACETOOUTPUT,
            GfxPdu::CapsAdvertise { .. } => CMDID_CAPSADVERTISE,
            GfxPdu::CapsConfirm { .. } => CMDID_CAPSCONFIRM,
            GfxPdu::Unknown { cmd_id } => *cmd_id,
        }
    }

    /// Encode header plus payload into `out`.
    ///
    /// All emitted commands carry `flags = 0`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(self.size());
        out.put_u16_le(self.cmd_id());
        out.put_u16_le(0);
        out.put_u32_le(self.size() as u32);

        match self {
            GfxPdu::SolidFill {
                surface_id,
                color,
                rects,
            } => {
                out.put_u16_le(*surface_id);
                out.put_u32_le(*color);
                out.put_u16_le(rects.len() as u16);
                for r in rects {
                    put_rect(out, r);
                }
            }
            GfxPdu::SurfaceToSurface {
                src_id,
                dst_id,
                src_rect,
                points,
            } => {
                out.put_u16_le(*src_id);
                out.put_u16_le(*dst_id);
                put_rect(out, src_rect);
                out.put_u16_le(points.len() as u16);
                for p in points {
                    out.put_u16_le(p.x);
                    out.put_u16_le(p.y);
                }
            }
            GfxPdu::CreateSurface {
                surface_id,
                width,
                height,
                pixel_format,
            } => {
                out.put_u16_le(*surface_id);
                out.put_u16_le(*width);
                out.put_u16_le(*height);
                out.put_u8(*pixel_format);
            }
            GfxPdu::StartFrame {
                timestamp,
                frame_id,
            } => {
                out.put_u32_le(*timestamp);
                out.put_u32_le(*frame_id);
            }
            GfxPdu::EndFrame { frame_id } => {
                out.put_u32_le(*frame_id);
            }
            GfxPdu::FrameAcknowledge {
                queue_depth,
                frame_id,
                total_frames_decoded,
            } => {
                out.put_u32_le(*queue_depth);
                out.put_u32_le(*frame_id);
                out.put_u32_le(*total_frames_decoded);
            }
            GfxPdu::MapSurfaceToOutput { surface_id, x, y } => {
                out.put_u16_le(*surface_id);
                out.put_u16_le(0); /* reserved */
                out.put_u32_le(*x);
                out.put_u32_le(*y);
            }
            GfxPdu::CapsAdvertise { caps } => {
                out.put_u16_le(caps.len() as u16);
                for c in caps {
                    out.put_u32_le(c.version);
                    out.put_u32_le(4); /* capsDataLength */
                    out.put_u32_le(c.flags);
                }
            }
            GfxPdu::CapsConfirm { version, flags } => {
                out.put_u32_le(*version);
                out.put_u32_le(4); /* capsDataLength */
                out.put_u32_le(*flags);
            }
            GfxPdu::Unknown { .. } => {}
        }
    }

    /// Decode one command from the front of `src`, advancing past it.
    ///
    /// The body is clamped to `pduLength - 8` bytes; trailing bytes of an
    /// over-long body are skipped so the outer loop stays aligned.
    pub fn decode(src: &mut &[u8]) -> Result<Self, GfxError> {
        if src.len() < HEADER_SIZE {
            return Err(GfxError::Truncated { cmd: "RDPGFX_HEADER" });
        }
        let cmd_id = src.get_u16_le();
        let _flags = src.get_u16_le();
        let pdu_length = src.get_u32_le();

        let body_len = (pdu_length as usize)
            .checked_sub(HEADER_SIZE)
            .ok_or(GfxError::BadLength { pdu_length })?;
        if src.len() < body_len {
            return Err(GfxError::Truncated { cmd: "RDPGFX body" });
        }

        let mut body = &src[..body_len];
        src.advance(body_len);

        match cmd_id {
            CMDID_SOLIDFILL => {
                ensure(&body, 8, "SOLIDFILL")?;
                let surface_id = body.get_u16_le();
                let color = body.get_u32_le();
                let num = body.get_u16_le() as usize;
                ensure(&body, num * 8, "SOLIDFILL rects")?;
                let rects = (0..num).map(|_| get_rect(&mut body)).collect();
                Ok(GfxPdu::SolidFill {
                    surface_id,
                    color,
                    rects,
                })
            }
            CMDID_SURFACETOSURFACE => {
                ensure(&body, 14, "SURFACETOSURFACE")?;
                let src_id = body.get_u16_le();
                let dst_id = body.get_u16_le();
                let src_rect = get_rect(&mut body);
                let num = body.get_u16_le() as usize;
                ensure(&body, num * 4, "SURFACETOSURFACE points")?;
                let points = (0..num)
                    .map(|_| GfxPoint {
                        x: body.get_u16_le(),
                        y: body.get_u16_le(),
                    })
                    .collect();
                Ok(GfxPdu::SurfaceToSurface {
                    src_id,
                    dst_id,
                    src_rect,
                    points,
                })
            }
            CMDID_CREATESURFACE => {
                ensure(&body, 7, "CREATESURFACE")?;
                Ok(GfxPdu::CreateSurface {
                    surface_id: body.get_u16_le(),
                    width: body.get_u16_le(),
                    height: body.get_u16_le(),
                    pixel_format: body.get_u8(),
                })
            }
            CMDID_STARTFRAME => {
                ensure(&body, 8, "STARTFRAME")?;
                Ok(GfxPdu::StartFrame {
                    timestamp: body.get_u32_le(),
                    frame_id: body.get_u32_le(),
                })
            }
            CMDID_ENDFRAME => {
                ensure(&body, 4, "ENDFRAME")?;
                Ok(GfxPdu::EndFrame {
                    frame_id: body.get_u32_le(),
                })
            }
            CMDID_FRAMEACKNOWLEDGE => {
                ensure(&body, 12, "FRAMEACKNOWLEDGE")?;
                Ok(GfxPdu::FrameAcknowledge {
                    queue_depth: body.get_u32_le(),
                    frame_id: body.get_u32_le(),
                    total_frames_decoded: body.get_u32_le(),
                })
            }
            CMDID_MAPSURFACETOOUTPUT => {
                ensure(&body, 12, "MAPSURFACETOOUTPUT")?;
                let surface_id = body.get_u16_le();
                let _reserved = body.get_u16_le();
                Ok(GfxPdu::MapSurfaceToOutput {
                    surface_id,
                    x: body.get_u32_le(),
                    y: body.get_u32_le(),
                })
            }
            CMDID_CAPSADVERTISE => {
                ensure(&body, 2, "CAPSADVERTISE")?;
                let count = body.get_u16_le() as usize;
                let mut caps = Vec::with_capacity(count);
                for _ in 0..count {
                    ensure(&body, 8, "CAPSADVERTISE set")?;
                    let version = body.get_u32_le();
                    let data_len = body.get_u32_le();
                    if data_len != 4 {
                        return Err(GfxError::BadCapsData { len: data_len });
                    }
                    ensure(&body, 4, "CAPSADVERTISE flags")?;
                    let flags = body.get_u32_le();
                    caps.push(CapsSet { version, flags });
                }
                Ok(GfxPdu::CapsAdvertise { caps })
            }
            CMDID_CAPSCONFIRM => {
                ensure(&body, 12, "CAPSCONFIRM")?;
                let version = body.get_u32_le();
                let data_len = body.get_u32_le();
                if data_len != 4 {
                    return Err(GfxError::BadCapsData { len: data_len });
                }
                Ok(GfxPdu::CapsConfirm {
                    version,
                    flags: body.get_u32_le(),
                })
            }
            other => Ok(GfxPdu::Unknown { cmd_id: other }),
        }
    }
}

fn put_rect(out: &mut BytesMut, r: &GfxRect) {
    out.put_u16_le(r.x1);
    out.put_u16_le(r.y1);
    out.put_u16_le(r.x2);
    out.put_u16_le(r.y2);
}

fn get_rect(body: &mut &[u8]) -> GfxRect {
    GfxRect {
        x1: body.get_u16_le(),
        y1: body.get_u16_le(),
        x2: body.get_u16_le(),
        y2: body.get_u16_le(),
    }
}

fn ensure(body: &&[u8], need: usize, cmd: &'static str) -> Result<(), GfxError> {
    if body.len() < need {
        return Err(GfxError::Truncated { cmd });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(pdu: &GfxPdu) -> GfxPdu {
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        assert_eq!(buf.len(), pdu.size());
        let mut slice = &buf[..];
        let decoded = GfxPdu::decode(&mut slice).expect("decode");
        assert!(slice.is_empty(), "decoder left {} bytes", slice.len());
        decoded
    }

    #[test]
    fn header_layout() {
        let pdu = GfxPdu::EndFrame { frame_id: 7 };
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        assert_eq!(&buf[..], &[0x0C, 0x00, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn solid_fill_roundtrip() {
        let pdu = GfxPdu::SolidFill {
            surface_id: 3,
            color: 0x00FF_8040,
            rects: vec![
                GfxRect { x1: 0, y1: 0, x2: 64, y2: 64 },
                GfxRect { x1: 100, y1: 200, x2: 300, y2: 400 },
            ],
        };
        assert_eq!(roundtrip(&pdu), pdu);
    }

    #[test]
    fn surface_to_surface_roundtrip() {
        let pdu = GfxPdu::SurfaceToSurface {
            src_id: 1,
            dst_id: 2,
            src_rect: GfxRect { x1: 16, y1: 16, x2: 32, y2: 32 },
            points: vec![GfxPoint { x: 0, y: 0 }, GfxPoint { x: 128, y: 64 }],
        };
        assert_eq!(roundtrip(&pdu), pdu);
    }

    #[test]
    fn caps_confirm_roundtrip() {
        let pdu = GfxPdu::CapsConfirm {
            version: CAPVERSION_104,
            flags: 0,
        };
        assert_eq!(roundtrip(&pdu), pdu);
    }

    #[test]
    fn caps_advertise_bad_data_len_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(CMDID_CAPSADVERTISE);
        buf.put_u16_le(0);
        buf.put_u32_le(8 + 2 + 12);
        buf.put_u16_le(1);
        buf.put_u32_le(CAPVERSION_104);
        buf.put_u32_le(8); /* capsDataLength must be 4 */
        buf.put_u32_le(0);
        let mut slice = &buf[..];
        assert!(matches!(
            GfxPdu::decode(&mut slice),
            Err(GfxError::BadCapsData { len: 8 })
        ));
    }

    #[test]
    fn short_header_rejected() {
        let mut slice: &[u8] = &[0x0C, 0x00, 0x00];
        assert!(GfxPdu::decode(&mut slice).is_err());
    }

    #[test]
    fn pdu_length_below_header_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(CMDID_ENDFRAME);
        buf.put_u16_le(0);
        buf.put_u32_le(4); /* < 8 */
        buf.put_u32_le(1);
        let mut slice = &buf[..];
        assert!(matches!(
            GfxPdu::decode(&mut slice),
            Err(GfxError::BadLength { pdu_length: 4 })
        ));
    }

    #[test]
    fn unknown_command_skips_body() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0x0016); /* QOEFRAMEACKNOWLEDGE, unhandled */
        buf.put_u16_le(0);
        buf.put_u32_le(8 + 8);
        buf.put_u64_le(0xDEAD_BEEF);
        // a second PDU right behind it
        GfxPdu::EndFrame { frame_id: 9 }.encode(&mut buf);

        let mut slice = &buf[..];
        assert_eq!(
            GfxPdu::decode(&mut slice).unwrap(),
            GfxPdu::Unknown { cmd_id: 0x0016 }
        );
        assert_eq!(
            GfxPdu::decode(&mut slice).unwrap(),
            GfxPdu::EndFrame { frame_id: 9 }
        );
    }

    proptest! {
        #[test]
        fn frame_ack_roundtrip(queue_depth: u32, frame_id: u32, total: u32) {
            let pdu = GfxPdu::FrameAcknowledge {
                queue_depth,
                frame_id,
                total_frames_decoded: total,
            };
            prop_assert_eq!(roundtrip(&pdu), pdu);
        }

        #[test]
        fn start_frame_roundtrip(timestamp: u32, frame_id: u32) {
            let pdu = GfxPdu::StartFrame { timestamp, frame_id };
            prop_assert_eq!(roundtrip(&pdu), pdu);
        }

        #[test]
        fn map_surface_roundtrip(surface_id: u16, x: u32, y: u32) {
            let pdu = GfxPdu::MapSurfaceToOutput { surface_id, x, y };
            prop_assert_eq!(roundtrip(&pdu), pdu);
        }

        #[test]
        fn solid_fill_any_rects(surface_id: u16, color: u32, raw in proptest::collection::vec((0u16..2000, 0u16..2000, 0u16..2000, 0u16..2000), 0..50)) {
            let rects: Vec<GfxRect> = raw
                .into_iter()
                .map(|(x1, y1, x2, y2)| GfxRect { x1, y1, x2, y2 })
                .collect();
            let pdu = GfxPdu::SolidFill { surface_id, color, rects };
            prop_assert_eq!(roundtrip(&pdu), pdu);
        }
    }
}
