//! # shmlink Shared Memory Transport
//!
//! Low-latency replacement for the byte stream of a local RESP connection.
//! After a one-round-trip handshake over the connection's socket, both
//! directions of traffic move into a pair of lock-free single-producer
//! single-consumer ring buffers in POSIX shared memory.
//!
//! ## Architecture Overview
//!
//! ```text
//!  client process                                    server process
//! ┌────────────────┐    ┌──────────────────────┐    ┌────────────────┐
//! │ Connection     │    │ SharedSegment        │    │ Connection     │
//! │  (Role::Client)├───►│ to_server RingBuffer ├───►│  (Role::Server)│
//! │                │◄───┤ to_client RingBuffer │◄───┤                │
//! └───────┬────────┘    └──────────────────────┘    └───────┬────────┘
//!         │              socket: handshake + liveness        │
//!         └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`ring`] - lock-free SPSC byte ring living inside the mapping
//! - [`segment`] - creation, attachment, unlinking and teardown of the segment
//! - [`io`] - socket-like read/write over the rings (atomic small writes,
//!   `WouldBlock`, `BrokenPipe`, end of stream)
//! - [`liveness`] - sampled detection of a peer that died without closing
//! - [`handshake`] - `SHM.OPEN` state machine
//! - [`connection`] - the connection tying it together
//! - [`resp`] - the RESP framing the handshake needs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shmlink::config::TransportConfig;
//! use shmlink_transport::{Connection, Role, ShmResult};
//! use std::io::{Read, Write};
//! use std::os::unix::net::UnixStream;
//!
//! fn main() -> ShmResult<()> {
//!     let stream = UnixStream::connect("/tmp/shmlink.sock")?;
//!     let mut conn = Connection::new(stream, Role::Client, TransportConfig::default())?;
//!     conn.upgrade(0o600)?;
//!
//!     conn.write_all(b"raw bytes over shared memory")?;
//!     let mut buf = [0u8; 64];
//!     let n = conn.read(&mut buf)?;
//!     println!("{:?}", &buf[..n]);
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Setup and handshake problems are [`TransportError`]s. Byte-level
//! conditions use `std::io::ErrorKind` exactly as a socket would:
//!
//! ```rust,no_run
//! use std::io::{ErrorKind, Write};
//! # fn send<W: Write>(conn: &mut W) {
//! match conn.write(b"PING") {
//!     Ok(n) => println!("wrote {n}"),
//!     Err(e) if e.kind() == ErrorKind::WouldBlock => { /* retry later */ }
//!     Err(e) if e.kind() == ErrorKind::BrokenPipe => eprintln!("peer gone"),
//!     Err(e) => eprintln!("write failed: {e}"),
//! }
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - **Connection**: one thread at a time, like the socket it wraps
//! - **RingBuffer**: one producer and one consumer, possibly in two processes
//!
//! ## Platform Support
//!
//! Linux only (`shm_open`, `/dev/shm`).

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod handshake;
pub mod io;
pub mod liveness;
pub mod platform;
pub mod resp;
pub mod ring;
pub mod segment;

pub use connection::{Connection, TransportMode, UpgradeOutcome};
pub use error::{ShmResult, TransportError};
pub use handshake::{HandshakeCoordinator, HandshakeState};
pub use io::SharedIo;
pub use liveness::{Liveness, LivenessProbe};
pub use resp::{
    Decoded, Reply, decode_command, decode_reply, encode_command, parse_command, parse_reply,
};
pub use ring::{Consumer, Producer, RingBuffer};
pub use segment::{Role, SEGMENT_SIZE, SegmentLayout, SharedSegment};

