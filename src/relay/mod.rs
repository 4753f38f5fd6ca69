//! Message relay and dispatch core
//!
//! The helper sits between the display server and the RDP server, copying
//! framed messages verbatim in both directions and intercepting two display
//! message classes on the way through:
//!
//! - paint batches carrying a dirty region in a shared pixmap, which are
//!   compressed in place through the GPU pipeline before forwarding, and
//! - control batches that create or delete the per-monitor GPU state,
//!   which are consumed.
//!
//! One cooperative loop serves both links plus the X connection; all reads
//! are non-blocking with resumable frame assembly, so nothing ever stalls
//! the opposite direction.

pub mod messages;
pub mod peer;
pub mod shmem;

use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, error, info, warn};

use crate::config::HelperConfig;
use crate::gpu::GpuContext;

use self::messages::{
    parse_outer, CreateMonitor, DirtyRegion, SubRecords, MSG_CONTROL, MSG_PAINT,
    SUB_CONTROL_CREATE, SUB_CONTROL_DELETE_ALL, SUB_PAINT_DIRTY_SHMEM,
};
use self::peer::{FramedMessage, PeerLink, PeerRole};
use self::shmem::{ShmemCache, ShmemError};

/// Output budget for one compressed frame.
const OUTPUT_CAP: usize = 16 * 1024 * 1024;

/// Idle tick; bounds the wait so the X queue is drained even when both
/// peers are quiet.
const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RelayError {
    /// Length field out of range; the link is beyond recovery.
    #[error("bad frame length {len} on {role} link")]
    Framing { role: PeerRole, len: u32 },

    #[error("{role} peer closed the connection")]
    PeerClosed { role: PeerRole },

    #[error("malformed {what}")]
    Malformed { what: &'static str },

    #[error(transparent)]
    Shmem(#[from] ShmemError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wraps the X connection descriptor for the wait set.
struct XConnFd(RawFd);

impl std::os::fd::AsRawFd for XConnFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

enum Wake {
    Display,
    Rdp,
    X11,
    Tick,
}

/// The dispatch core: two peer links, the GPU pipeline, and the shared
/// memory cache for encode output.
pub struct Relay {
    display: PeerLink,
    rdp: PeerLink,
    // x_fd watches the connection owned by gpu; keep it above so it
    // deregisters before the display closes
    x_fd: AsyncFd<XConnFd>,
    gpu: GpuContext,
    shmem: ShmemCache,
}

impl Relay {
    pub fn new(config: &HelperConfig, gpu: GpuContext) -> Result<Self, RelayError> {
        let display = PeerLink::from_raw_fd(config.xorg_fd, PeerRole::Display)?;
        let rdp = PeerLink::from_raw_fd(config.xrdp_fd, PeerRole::Rdp)?;
        let x_fd = AsyncFd::with_interest(XConnFd(gpu.connection_fd()), Interest::READABLE)?;
        Ok(Self {
            display,
            rdp,
            x_fd,
            gpu,
            shmem: ShmemCache::new(),
        })
    }

    /// Serve both links until a fatal link error.
    pub async fn run(&mut self) -> Result<(), RelayError> {
        info!("relay loop up");
        loop {
            let wake = tokio::select! {
                r = self.display.readable() => {
                    r?;
                    Wake::Display
                }
                r = self.rdp.readable() => {
                    r?;
                    Wake::Rdp
                }
                guard = self.x_fd.readable() => {
                    let mut guard = guard?;
                    guard.clear_ready();
                    Wake::X11
                }
                _ = tokio::time::sleep(TICK) => Wake::Tick,
            };

            match wake {
                Wake::Display => self.drain_display().await?,
                Wake::Rdp => self.drain_rdp().await?,
                Wake::X11 | Wake::Tick => self.gpu.pump_events(),
            }
        }
    }

    async fn drain_display(&mut self) -> Result<(), RelayError> {
        while let Some(frame) = self.display.try_recv()? {
            if let Some(forward) = self.dispatch_display(frame)? {
                self.rdp.send(&forward).await?;
            }
        }
        Ok(())
    }

    async fn drain_rdp(&mut self) -> Result<(), RelayError> {
        // rdp-to-display traffic is relayed untouched
        while let Some(frame) = self.rdp.try_recv()? {
            self.display.send(&frame).await?;
        }
        Ok(())
    }

    /// Handle one display frame; returns the frame to forward, or `None`
    /// when the helper consumed it.
    fn dispatch_display(
        &mut self,
        frame: FramedMessage,
    ) -> Result<Option<FramedMessage>, RelayError> {
        let (header, payload) = parse_outer(&frame)?;
        match header.msg_type {
            MSG_PAINT => {
                self.process_paint(header.num, payload);
                Ok(Some(frame))
            }
            MSG_CONTROL => {
                self.process_control(header.num, payload);
                Ok(None)
            }
            _ => Ok(Some(frame)),
        }
    }

    /// Walk a paint batch, compressing every shared-pixmap dirty region
    /// in place. Per-record failures drop that frame's compression but
    /// never the relay.
    fn process_paint(&mut self, num: u16, payload: &[u8]) {
        for record in SubRecords::new(payload, num) {
            let (sub_type, body) = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "stopping paint batch walk");
                    return;
                }
            };
            if sub_type != SUB_PAINT_DIRTY_SHMEM {
                continue;
            }
            match DirtyRegion::parse(body) {
                Ok(region) => self.encode_region(&region),
                Err(e) => warn!(error = %e, "bad dirty-region record"),
            }
        }
    }

    fn encode_region(&mut self, region: &DirtyRegion) {
        if region.flags != 0 {
            // only flag 0 (screen) updates carry a shared bitstream buffer
            return;
        }

        let mapped = match self.shmem.attach(region.shmem_id as i32) {
            Ok(mapped) => mapped,
            Err(e) => {
                warn!(error = %e, shmem_id = region.shmem_id, "cannot attach shared segment");
                return;
            }
        };

        let offset = region.shmem_offset as usize;
        let bytes = mapped.as_mut_slice();
        if offset + 4 > bytes.len() {
            warn!(offset, size = bytes.len(), "shmem offset outside segment");
            return;
        }
        let (len_field, rest) = bytes[offset..].split_at_mut(4);
        let cap = rest.len().min(OUTPUT_CAP);
        let dst = &mut rest[..cap];

        match self.gpu.encode_dirty(
            0,
            region.width,
            region.height,
            &region.crects,
            dst,
        ) {
            Ok(written) => {
                len_field.copy_from_slice(&(written as u32).to_le_bytes());
                debug!(
                    bytes = written,
                    crects = region.crects.len(),
                    "frame compressed"
                );
            }
            Err(e) => {
                // frame dropped; the monitor stays valid for the next one
                error!(error = %e, "encode failed");
            }
        }
    }

    /// Control batches manage monitor lifecycle and are not forwarded.
    fn process_control(&mut self, num: u16, payload: &[u8]) {
        for record in SubRecords::new(payload, num) {
            let (sub_type, body) = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "stopping control batch walk");
                    return;
                }
            };
            match sub_type {
                SUB_CONTROL_DELETE_ALL => {
                    info!("delete all monitors");
                    self.gpu.delete_all_monitors();
                }
                SUB_CONTROL_CREATE => match CreateMonitor::parse(body) {
                    Ok(req) => {
                        if let Err(e) = self.gpu.create_monitor(
                            req.width, req.height, req.magic, req.con_id, req.mon_id,
                        ) {
                            error!(error = %e, mon_id = req.mon_id, "monitor create failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "bad create-monitor record"),
                },
                other => debug!(sub_type = other, "ignoring control record"),
            }
        }
    }
}
