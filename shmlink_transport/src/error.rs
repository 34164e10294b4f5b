//! Error types for shared memory transport operations

use thiserror::Error;

/// Errors that can occur while setting up or upgrading a transport.
///
/// Byte-level transport conditions (would block, broken pipe, end of
/// stream) are reported through `std::io::Error` kinds instead, exactly as a
/// socket reports them.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No randomness available to name the segment, or the name buffer overflowed
    #[error("Out of memory while naming shared memory segment")]
    OutOfMemory,

    /// The named shared memory object could not be created or opened
    #[error("Can't create shared memory object {name}: {source}")]
    ResourceCreationFailed {
        /// Segment name
        name: String,
        /// Source nix error
        source: nix::Error,
    },

    /// The shared memory object could not be grown to the segment size
    #[error("Out of shared memory: can't size {name} to {size} bytes")]
    SizingFailed {
        /// Segment name
        name: String,
        /// Requested size in bytes
        size: usize,
        /// Source IO error
        source: std::io::Error,
    },

    /// The shared memory object could not be mapped
    #[error("Can't mmap shared memory object {name}: {source}")]
    MappingFailed {
        /// Segment name
        name: String,
        /// Source IO error
        source: std::io::Error,
    },

    /// An attached object does not have the expected segment layout
    #[error("Segment {name} has {actual} bytes, expected {expected}")]
    LayoutMismatch {
        /// Segment name
        name: String,
        /// Expected size in bytes
        expected: usize,
        /// Actual size in bytes
        actual: u64,
    },

    /// The peer declined the handshake or replied unexpectedly
    #[error("Shared memory handshake rejected: {reply}")]
    ProtocolRejected {
        /// Description of the reply that was received
        reply: String,
    },

    /// An upgrade was requested while another one is pending or established
    #[error("Shared memory handshake already in progress or established")]
    HandshakeInProgress,

    /// Malformed command or reply framing
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl TransportError {
    /// True when the error only means "no progress possible right now"
    pub fn is_would_block(&self) -> bool {
        matches!(self, TransportError::Io { source } if source.kind() == std::io::ErrorKind::WouldBlock)
    }
}

/// Result type for shared memory transport operations
pub type ShmResult<T> = Result<T, TransportError>;
