//! Shared memory segment holding one ring buffer per direction

use crate::error::{ShmResult, TransportError};
use crate::platform::{
    SegmentName, create_shm_object, map_shm_object, open_shm_object, random_segment_name,
    unlink_shm_object,
};
use crate::ring::{Consumer, Producer, RingBuffer};
use memmap2::MmapMut;
use shmlink::consts::{CACHE_LINE_SIZE, SHM_BUFFER_SIZE};
use static_assertions::{const_assert, const_assert_eq};
use std::sync::atomic::{Ordering, fence};
use tracing::debug;

/// Ring buffer type used for both directions.
pub type SegmentBuffer = RingBuffer<SHM_BUFFER_SIZE>;

/// Layout of the mapped region. Both processes must agree on it, which the
/// handshake protocol version guarantees.
#[repr(C)]
pub struct SegmentLayout {
    /// Written by the client, read by the server
    pub to_server: SegmentBuffer,
    /// Written by the server, read by the client
    pub to_client: SegmentBuffer,
}

/// Size in bytes of the shared memory object.
pub const SEGMENT_SIZE: usize = std::mem::size_of::<SegmentLayout>();

const_assert_eq!(SEGMENT_SIZE, 2 * (2 * CACHE_LINE_SIZE + SHM_BUFFER_SIZE));
const_assert!(std::mem::align_of::<SegmentLayout>() == CACHE_LINE_SIZE);

/// Which end of the connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Writes `to_server`, reads `to_client`
    Client,
    /// Writes `to_client`, reads `to_server`
    Server,
}

/// OS shared memory object mapped into this process.
///
/// Owned by exactly one connection. The creating side owns the name and
/// unlinks it; the attaching side never does.
pub struct SharedSegment {
    name: SegmentName,
    mode: u32,
    role: Role,
    /// Name still present in the shm namespace and owned by us
    named: bool,
    mmap: Option<MmapMut>,
}

impl SharedSegment {
    /// Create a fresh segment under a random name (client side).
    ///
    /// Both ring buffers start empty. On failure nothing is left behind:
    /// the name is unlinked and nothing stays mapped.
    pub fn create(mode: u32) -> ShmResult<Self> {
        let name = random_segment_name()?;
        let mut segment = Self {
            name,
            mode,
            role: Role::Client,
            named: false,
            mmap: None,
        };

        let file = create_shm_object(&segment.name, SEGMENT_SIZE, mode)?;
        segment.named = true;

        let mmap = match map_shm_object(&file, &segment.name, SEGMENT_SIZE) {
            Ok(mmap) => mmap,
            Err(e) => {
                segment.destroy();
                return Err(e);
            }
        };
        // The mapping keeps the object alive; the descriptor is not needed.
        drop(file);

        {
            // SAFETY: freshly mapped, SEGMENT_SIZE bytes, page aligned.
            let layout = unsafe { &*(mmap.as_ptr() as *const SegmentLayout) };
            layout.to_server.init();
            layout.to_client.init();
        }
        fence(Ordering::Release);
        segment.mmap = Some(mmap);

        debug!(name = %segment.name, size = SEGMENT_SIZE, mode, "shared memory segment created");
        Ok(segment)
    }

    /// Attach to a segment created by the peer (server side).
    pub fn attach(name: &str) -> ShmResult<Self> {
        let mut segment_name = SegmentName::new();
        segment_name
            .push_str(name)
            .map_err(|_| TransportError::ResourceCreationFailed {
                name: name.to_string(),
                source: nix::Error::ENAMETOOLONG,
            })?;

        let file = open_shm_object(name)?;
        let actual = file.metadata()?.len();
        if actual != SEGMENT_SIZE as u64 {
            return Err(TransportError::LayoutMismatch {
                name: name.to_string(),
                expected: SEGMENT_SIZE,
                actual,
            });
        }

        let mmap = map_shm_object(&file, name, SEGMENT_SIZE)?;
        fence(Ordering::Acquire);

        debug!(name, "shared memory segment attached");
        Ok(Self {
            name: segment_name,
            mode: 0,
            role: Role::Server,
            named: false,
            mmap: Some(mmap),
        })
    }

    /// Segment name in the shm namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Permission bits the object was created with (0 when attached).
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Which end of the connection owns this mapping.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True while the name is still present and owned by this segment.
    pub fn is_named(&self) -> bool {
        self.named
    }

    /// True while the region is mapped.
    pub fn is_mapped(&self) -> bool {
        self.mmap.is_some()
    }

    /// Remove the name from the shm namespace, keeping the mapping.
    ///
    /// After this a crash cannot leak the object: the OS reclaims it once
    /// every mapping is gone. Idempotent.
    pub fn unlink_name(&mut self) {
        if !self.named {
            return;
        }
        if let Err(e) = unlink_shm_object(&self.name) {
            debug!(name = %self.name, error = %e, "shm_unlink failed");
        }
        self.named = false;
        debug!(name = %self.name, "shared memory name unlinked");
    }

    /// Unmap the region and unlink the name if still present. Idempotent.
    pub fn destroy(&mut self) {
        if self.mmap.take().is_some() {
            debug!(name = %self.name, "shared memory segment unmapped");
        }
        self.unlink_name();
    }

    /// Ring this process writes into.
    ///
    /// `&mut self` keeps the handle unique within this process; the role
    /// split keeps it unique across the two processes.
    pub fn outbound(&mut self) -> Option<Producer<'_, SHM_BUFFER_SIZE>> {
        let role = self.role;
        let layout = self.try_layout()?;
        let ring = match role {
            Role::Client => &layout.to_server,
            Role::Server => &layout.to_client,
        };
        // SAFETY: this role is the only writer of this direction.
        Some(unsafe { ring.producer() })
    }

    /// Ring this process reads from.
    pub fn inbound(&mut self) -> Option<Consumer<'_, SHM_BUFFER_SIZE>> {
        let role = self.role;
        let layout = self.try_layout()?;
        let ring = match role {
            Role::Client => &layout.to_client,
            Role::Server => &layout.to_server,
        };
        // SAFETY: this role is the only reader of this direction.
        Some(unsafe { ring.consumer() })
    }

    fn try_layout(&self) -> Option<&SegmentLayout> {
        // SAFETY: the mapping is SEGMENT_SIZE bytes, page aligned, and
        // SegmentLayout is valid for any bit pattern of its atomics and bytes.
        self.mmap
            .as_ref()
            .map(|mmap| unsafe { &*(mmap.as_ptr() as *const SegmentLayout) })
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name.as_str())
            .field("role", &self.role)
            .field("named", &self.named)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
