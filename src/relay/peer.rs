//! Framed peer links
//!
//! Both peers speak length-framed messages over a local stream socket, with
//! different header shapes:
//!
//! - display side: `[type:u16le][num:u16le][size:u32le]`, body `size` bytes
//! - rdp side: `[length:u32le]`, body `length` bytes
//!
//! Reads are non-blocking and frame assembly is resumable: a partial header
//! or body survives across wakeups in the link's buffer. Both length fields
//! are clamped at 128 KiB; a violation poisons the link.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::trace;

use super::RelayError;

/// Upper bound for either side's length field.
pub const MAX_FRAME: usize = 128 * 1024;

const READ_CHUNK: usize = 32 * 1024;

/// Which peer a link talks to; decides the framing discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Display,
    Rdp,
}

impl PeerRole {
    pub fn header_size(self) -> usize {
        match self {
            PeerRole::Display => 8,
            PeerRole::Rdp => 4,
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Display => write!(f, "display"),
            PeerRole::Rdp => write!(f, "rdp"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    AwaitingHeader,
    /// Header parsed; the frame is `total` bytes including the header.
    AwaitingBody { total: usize },
}

/// One complete frame, header included, as read off a link.
pub type FramedMessage = Bytes;

/// A peer connection with its parser state.
pub struct PeerLink {
    role: PeerRole,
    stream: UnixStream,
    buf: BytesMut,
    phase: Phase,
}

impl PeerLink {
    /// Adopt an inherited descriptor.
    pub fn from_raw_fd(fd: RawFd, role: PeerRole) -> std::io::Result<Self> {
        // SAFETY: the parent process handed us this descriptor to own.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let std_stream = std::os::unix::net::UnixStream::from(owned);
        std_stream.set_nonblocking(true)?;
        Ok(Self {
            role,
            stream: UnixStream::from_std(std_stream)?,
            buf: BytesMut::with_capacity(MAX_FRAME + 8),
            phase: Phase::AwaitingHeader,
        })
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Wait until the socket has data.
    pub async fn readable(&self) -> std::io::Result<()> {
        self.stream.readable().await
    }

    /// Pull the next complete frame, reading as much as is available.
    ///
    /// `Ok(None)` means the socket ran dry mid-frame; parser state is kept
    /// for the next wakeup.
    pub fn try_recv(&mut self) -> Result<Option<FramedMessage>, RelayError> {
        loop {
            if let Some(frame) = self.extract_frame()? {
                return Ok(Some(frame));
            }
            match self.stream.try_read_buf(&mut self.buf) {
                Ok(0) => return Err(RelayError::PeerClosed { role: self.role }),
                Ok(n) => {
                    trace!(role = %self.role, bytes = n, "read");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(RelayError::Io(e)),
            }
        }
    }

    fn extract_frame(&mut self) -> Result<Option<FramedMessage>, RelayError> {
        if let Phase::AwaitingHeader = self.phase {
            let header_size = self.role.header_size();
            if self.buf.len() < header_size {
                // grow headroom for the next read
                if self.buf.capacity() - self.buf.len() < READ_CHUNK {
                    self.buf.reserve(READ_CHUNK);
                }
                return Ok(None);
            }
            let len = match self.role {
                PeerRole::Display => (&self.buf[4..8]).get_u32_le(),
                PeerRole::Rdp => (&self.buf[0..4]).get_u32_le(),
            };
            if len as usize > MAX_FRAME {
                return Err(RelayError::Framing {
                    role: self.role,
                    len,
                });
            }
            self.phase = Phase::AwaitingBody {
                total: header_size + len as usize,
            };
        }

        if let Phase::AwaitingBody { total } = self.phase {
            if self.buf.len() < total {
                if self.buf.capacity() - self.buf.len() < READ_CHUNK {
                    self.buf.reserve(READ_CHUNK);
                }
                return Ok(None);
            }
            self.phase = Phase::AwaitingHeader;
            return Ok(Some(self.buf.split_to(total).freeze()));
        }
        Ok(None)
    }

    /// Forward a complete frame to this peer.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), RelayError> {
        self.stream.write_all(frame).await.map_err(RelayError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    fn pair(role: PeerRole) -> (PeerLink, std::os::unix::net::UnixStream) {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let link = PeerLink::from_raw_fd(a.into_raw_fd(), role).unwrap();
        (link, b)
    }

    fn display_frame(msg_type: u16, num: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&msg_type.to_le_bytes());
        frame.extend_from_slice(&num.to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[tokio::test]
    async fn display_frame_reassembles_across_split_writes() {
        use std::io::Write;

        let (mut link, mut tx) = pair(PeerRole::Display);
        let frame = display_frame(3, 1, &[0xAA; 100]);

        // dribble the frame in awkward pieces
        for chunk in frame.chunks(7) {
            tx.write_all(chunk).unwrap();
            link.readable().await.unwrap();
            if let Some(got) = link.try_recv().unwrap() {
                assert_eq!(&got[..], &frame[..]);
                return;
            }
        }
        panic!("frame never completed");
    }

    #[tokio::test]
    async fn rdp_frames_are_length_prefixed() {
        use std::io::Write;

        let (mut link, mut tx) = pair(PeerRole::Rdp);
        let mut wire = Vec::new();
        for body in [&b"hello"[..], &b"world!"[..]] {
            wire.extend_from_slice(&(body.len() as u32).to_le_bytes());
            wire.extend_from_slice(body);
        }
        tx.write_all(&wire).unwrap();

        link.readable().await.unwrap();
        let first = link.try_recv().unwrap().expect("first frame");
        assert_eq!(&first[4..], b"hello");
        let second = link.try_recv().unwrap().expect("second frame");
        assert_eq!(&second[4..], b"world!");
        assert!(link.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_length_body_is_a_complete_frame() {
        use std::io::Write;

        let (mut link, mut tx) = pair(PeerRole::Rdp);
        tx.write_all(&0u32.to_le_bytes()).unwrap();
        link.readable().await.unwrap();
        let frame = link.try_recv().unwrap().expect("frame");
        assert_eq!(frame.len(), 4);
    }

    #[tokio::test]
    async fn oversize_length_poisons_the_link() {
        use std::io::Write;

        let (mut link, mut tx) = pair(PeerRole::Rdp);
        tx.write_all(&(MAX_FRAME as u32 + 1).to_le_bytes()).unwrap();
        link.readable().await.unwrap();
        assert!(matches!(
            link.try_recv(),
            Err(RelayError::Framing { role: PeerRole::Rdp, .. })
        ));
    }

    #[tokio::test]
    async fn peer_close_is_reported() {
        let (mut link, tx) = pair(PeerRole::Display);
        drop(tx);
        link.readable().await.unwrap();
        assert!(matches!(
            link.try_recv(),
            Err(RelayError::PeerClosed { role: PeerRole::Display })
        ));
    }
}
