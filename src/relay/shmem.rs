//! System V shared memory attachments
//!
//! The display server hands over dirty-region updates that name a SysV
//! segment id; the compressed bitstream is written back into that segment.
//! Attachment is scoped: the cache keeps exactly one segment mapped,
//! reattaches only when the id changes, and detaches on drop.

use std::ffi::c_void;
use std::ptr;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("shmat({id}) failed: {source}")]
    Attach {
        id: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("shmctl({id}, IPC_STAT) failed: {source}")]
    Stat {
        id: i32,
        #[source]
        source: std::io::Error,
    },
}

/// One attached segment.
pub struct SharedRegion {
    id: i32,
    base: *mut u8,
    size: usize,
}

impl SharedRegion {
    pub fn attach(id: i32) -> Result<Self, ShmemError> {
        // SAFETY: plain SysV attach; -1 signals failure.
        let base = unsafe { libc::shmat(id, ptr::null(), 0) };
        if base == usize::MAX as *mut c_void {
            return Err(ShmemError::Attach {
                id,
                source: std::io::Error::last_os_error(),
            });
        }

        // SAFETY: ds is fully written by a successful IPC_STAT.
        let size = unsafe {
            let mut ds: libc::shmid_ds = std::mem::zeroed();
            if libc::shmctl(id, libc::IPC_STAT, &mut ds) != 0 {
                let source = std::io::Error::last_os_error();
                libc::shmdt(base);
                return Err(ShmemError::Stat { id, source });
            }
            ds.shm_segsz as usize
        };
        debug!(id, size, "shared segment attached");

        Ok(Self {
            id,
            base: base as *mut u8,
            size,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The whole segment. Single-writer while a dirty-region record is in
    /// flight, per the IPC contract with the display server.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: base..base+size is mapped for the life of self.
        unsafe { std::slice::from_raw_parts_mut(self.base, self.size) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: base came from shmat and is detached exactly once.
        unsafe {
            libc::shmdt(self.base as *const c_void);
        }
    }
}

/// Keeps the most recent segment attached across frames.
#[derive(Default)]
pub struct ShmemCache {
    region: Option<SharedRegion>,
}

impl ShmemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `id`, reusing the current mapping when the id is unchanged.
    pub fn attach(&mut self, id: i32) -> Result<&mut SharedRegion, ShmemError> {
        match self.region.take() {
            Some(region) if region.id() == id => Ok(self.region.insert(region)),
            // a stale mapping detaches here, before the new attach
            _ => Ok(self.region.insert(SharedRegion::attach(id)?)),
        }
    }
}
