//! Shared memory transport constants.
//!
//! These constants are the single source of truth for the segment layout and
//! the handshake protocol. Both sides of a connection must be built against
//! the same values; the handshake carries [`SHM_PROTO_VERSION`] so a mismatch
//! is refused instead of corrupting the buffers.

use static_assertions::const_assert;

/// Capacity of each ring buffer in bytes (one per direction).
///
/// 16KB matches the temporary buffer a RESP reply reader works best with.
pub const SHM_BUFFER_SIZE: usize = 16 * 1024;

/// Version of the `SHM.OPEN` handshake and of the segment layout.
pub const SHM_PROTO_VERSION: i64 = 1;

/// Command name of the handshake.
pub const SHM_OPEN_COMMAND: &str = "SHM.OPEN";

/// Integer reply value that accepts the handshake.
pub const SHM_OPEN_ACCEPTED: i64 = 1;

/// Largest write that must land atomically (all bytes or none).
///
/// Mirrors the host's `PIPE_BUF` guarantee for pipes and sockets.
pub const ATOMIC_WRITE_MAX: usize = libc::PIPE_BUF;

/// Default number of transport loop iterations between two liveness checks.
pub const LIVENESS_CHECK_INTERVAL: u64 = 10_000;

/// Default permission bits of the shared memory object.
pub const DEFAULT_SHM_MODE: u32 = 0o700;

/// Prefix of every segment name in the POSIX shm namespace.
pub const SHM_NAME_PREFIX: &str = "/";

/// Length of a segment name: prefix plus a hyphenated UUID.
pub const SHM_NAME_LEN: usize = SHM_NAME_PREFIX.len() + 36;

/// CPU cache line size in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

const_assert!(ATOMIC_WRITE_MAX <= SHM_BUFFER_SIZE);
const_assert!(SHM_BUFFER_SIZE % CACHE_LINE_SIZE == 0);
