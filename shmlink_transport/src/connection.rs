//! RESP connection that can move its traffic onto shared memory.
//!
//! A [`Connection`] wraps an established stream socket. It starts out
//! sending and receiving over the socket. [`Connection::upgrade`] creates a
//! [`SharedSegment`], announces it with `SHM.OPEN <version> <name>` and, once
//! the peer answers `:1`, routes every later read and write through the
//! segment's ring buffers. The socket stays open as the liveness channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use shmlink::config::TransportConfig;
//! use shmlink_transport::{Connection, Role, ShmResult, UpgradeOutcome};
//! use std::os::unix::net::UnixStream;
//!
//! fn main() -> ShmResult<()> {
//!     let stream = UnixStream::connect("/tmp/shmlink.sock")?;
//!     let mut conn = Connection::new(stream, Role::Client, TransportConfig::default())?;
//!
//!     if let UpgradeOutcome::Established(_) = conn.upgrade(0o600)? {
//!         conn.send_command(&[b"PING"])?;
//!         println!("{}", conn.read_reply()?);
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::{ShmResult, TransportError};
use crate::handshake::{HandshakeCoordinator, HandshakeState};
use crate::io::SharedIo;
use crate::platform::set_fd_blocking;
use crate::resp::{Decoded, Reply, decode_command, decode_reply, encode_command};
use crate::segment::{Role, SharedSegment};
use shmlink::config::TransportConfig;
use shmlink::consts::{SHM_BUFFER_SIZE, SHM_OPEN_ACCEPTED, SHM_OPEN_COMMAND, SHM_PROTO_VERSION};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use tracing::{debug, info, warn};

/// Observable transport mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Plain socket, no upgrade attempted
    SocketOnly,
    /// `SHM.OPEN` sent, reply not yet seen (non-blocking only)
    HandshakePending,
    /// Traffic runs over shared memory
    SharedMemory,
    /// Last upgrade failed or was rejected; traffic stays on the socket
    Failed,
}

/// Result of [`Connection::upgrade`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Blocking connection: the peer accepted with this reply
    Established(Reply),
    /// Non-blocking connection: the reply will be picked up by
    /// [`Connection::read_reply`]
    Pending,
}

/// Where the bytes of a connection go.
#[derive(Debug, Default)]
enum Transport {
    #[default]
    Socket,
    /// Segment created and announced; I/O still on the socket
    Pending(SharedSegment),
    Shared(SharedSegment),
}

/// A RESP connection over a stream socket, upgradable to shared memory.
pub struct Connection<S: Read + Write + AsFd> {
    stream: S,
    role: Role,
    config: TransportConfig,
    io: SharedIo,
    transport: Transport,
    handshake: HandshakeCoordinator,
    /// Encoded commands or replies not yet handed to the transport
    obuf: Vec<u8>,
    /// Received bytes not yet decoded
    ibuf: Vec<u8>,
    /// `ibuf` length below which decoding cannot progress
    ibuf_wanted: usize,
    /// Replies read ahead of the handshake reply by a blocking upgrade
    stashed: VecDeque<Reply>,
    commands_sent: u64,
    replies_received: u64,
}

impl<S: Read + Write + AsFd> Connection<S> {
    /// Wrap a connected stream, applying the configured blocking mode.
    pub fn new(stream: S, role: Role, config: TransportConfig) -> ShmResult<Self> {
        set_fd_blocking(stream.as_fd(), config.blocking)?;
        Ok(Self {
            stream,
            role,
            io: SharedIo::from_config(&config),
            config,
            transport: Transport::Socket,
            handshake: HandshakeCoordinator::new(),
            obuf: Vec::new(),
            ibuf: Vec::new(),
            ibuf_wanted: 0,
            stashed: VecDeque::new(),
            commands_sent: 0,
            replies_received: 0,
        })
    }

    /// Current transport mode.
    pub fn mode(&self) -> TransportMode {
        match &self.transport {
            Transport::Shared(_) => TransportMode::SharedMemory,
            Transport::Pending(_) => TransportMode::HandshakePending,
            Transport::Socket => match self.handshake.state() {
                HandshakeState::Rejected | HandshakeState::Failed => TransportMode::Failed,
                _ => TransportMode::SocketOnly,
            },
        }
    }

    /// Current handshake state.
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// True once traffic runs over shared memory.
    pub fn is_established(&self) -> bool {
        matches!(self.transport, Transport::Shared(_))
    }

    /// Which end of the connection this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Transport settings in effect.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Name of the attached or created segment, if any.
    pub fn segment_name(&self) -> Option<&str> {
        match &self.transport {
            Transport::Pending(segment) | Transport::Shared(segment) => Some(segment.name()),
            Transport::Socket => None,
        }
    }

    /// Underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Ask the peer to move this connection onto shared memory.
    ///
    /// Blocking connections wait for the reply and either return
    /// [`UpgradeOutcome::Established`] or an error; replies to commands sent
    /// earlier are kept for [`Connection::read_reply`]. Non-blocking
    /// connections return [`UpgradeOutcome::Pending`] as soon as the command
    /// is queued.
    ///
    /// Whatever happens, the socket connection keeps working.
    pub fn upgrade(&mut self, mode: u32) -> ShmResult<UpgradeOutcome> {
        if self.role != Role::Client {
            return Err(TransportError::Protocol(
                "only client connections can request an upgrade".to_string(),
            ));
        }
        if !matches!(self.transport, Transport::Socket) {
            return Err(TransportError::HandshakeInProgress);
        }
        self.handshake.begin()?;

        let segment = match SharedSegment::create(mode) {
            Ok(segment) => segment,
            Err(e) => {
                self.handshake.fail();
                warn!(error = %e, "shared memory upgrade failed");
                return Err(e);
            }
        };

        // Written while the segment is detached: the command goes out over
        // the socket.
        let version = SHM_PROTO_VERSION.to_string();
        let command = encode_command(&[
            SHM_OPEN_COMMAND.as_bytes(),
            version.as_bytes(),
            segment.name().as_bytes(),
        ]);
        self.obuf.extend_from_slice(&command);
        self.commands_sent += 1;
        if let Err(e) = self.flush_pending() {
            if e.kind() != ErrorKind::WouldBlock {
                // Withdraw the command unless part of it already left;
                // earlier pipelined commands stay queued.
                if self.obuf.len() >= command.len() {
                    self.obuf.truncate(self.obuf.len() - command.len());
                    self.commands_sent -= 1;
                }
                self.handshake.fail();
                warn!(error = %e, "shared memory upgrade failed");
                return Err(e.into());
            }
        }

        self.handshake.command_sent(self.commands_sent);
        debug!(name = segment.name(), "SHM.OPEN sent");
        self.transport = Transport::Pending(segment);

        if !self.config.blocking {
            return Ok(UpgradeOutcome::Pending);
        }

        let reply = loop {
            match self.receive_reply() {
                Ok((reply, true)) => break reply,
                Ok((reply, false)) => self.stashed.push_back(reply),
                Err(e) => return Err(e),
            }
        };

        if self.is_established() {
            Ok(UpgradeOutcome::Established(reply))
        } else {
            Err(TransportError::ProtocolRejected {
                reply: reply.to_string(),
            })
        }
    }

    /// Settle an outstanding handshake from its reply.
    ///
    /// `None` means the reply could not be read. Returns `true` exactly once:
    /// on the call that switches the connection to shared memory. Any other
    /// call, including every call while no handshake is outstanding, is a
    /// no-op returning `false`.
    pub fn finalize_handshake(&mut self, reply: Option<&Reply>) -> bool {
        if self.handshake.state() != HandshakeState::CommandSent {
            return false;
        }
        let mut segment = match std::mem::take(&mut self.transport) {
            Transport::Pending(segment) => segment,
            other => {
                self.transport = other;
                return false;
            }
        };

        // The peer has opened the name by now, or never will.
        segment.unlink_name();

        match self.handshake.resolve(reply) {
            HandshakeState::Established => {
                info!(name = segment.name(), "shared memory transport established");
                self.transport = Transport::Shared(segment);
                true
            }
            state => {
                match reply {
                    Some(reply) => warn!(%reply, "shared memory upgrade rejected"),
                    None => warn!(?state, "shared memory upgrade failed: no reply"),
                }
                segment.destroy();
                false
            }
        }
    }

    /// Queue a command and hand it to the transport.
    ///
    /// On a non-blocking connection bytes the transport cannot take yet stay
    /// queued and go out with the next call.
    pub fn send_command(&mut self, args: &[&[u8]]) -> ShmResult<()> {
        self.queue_command(args);
        match self.flush_pending() {
            Err(e) if e.kind() != ErrorKind::WouldBlock => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Read the next reply.
    ///
    /// The reply answering an outstanding `SHM.OPEN` settles the handshake
    /// before it is returned. Non-blocking connections report
    /// [`TransportError::is_would_block`] until a full reply has arrived.
    pub fn read_reply(&mut self) -> ShmResult<Reply> {
        if let Some(reply) = self.stashed.pop_front() {
            return Ok(reply);
        }
        match self.flush_pending() {
            Err(e) if e.kind() != ErrorKind::WouldBlock => return Err(e.into()),
            _ => {}
        }
        self.receive_reply().map(|(reply, _)| reply)
    }

    /// Server side: read the next command. `Ok(None)` at end of stream.
    pub fn read_command(&mut self) -> ShmResult<Option<Vec<Vec<u8>>>> {
        loop {
            if self.ibuf.len() >= self.ibuf_wanted {
                match decode_command(&self.ibuf)? {
                    Decoded::Complete(args, used) => {
                        self.consume_input(used);
                        return Ok(Some(args));
                    }
                    Decoded::Partial { wanted } => self.ibuf_wanted = wanted,
                }
            }
            if self.fill_input()? == 0 {
                if self.ibuf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Protocol(
                    "connection closed in the middle of a command".to_string(),
                ));
            }
        }
    }

    /// Server side: queue a reply and hand it to the transport.
    pub fn send_reply(&mut self, reply: &Reply) -> ShmResult<()> {
        self.obuf.extend_from_slice(&reply.encode());
        match self.flush_pending() {
            Err(e) if e.kind() != ErrorKind::WouldBlock => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Server side: answer a `SHM.OPEN` request.
    ///
    /// `args` are the arguments following the command name. On success the
    /// acceptance reply goes out over the socket and the connection switches
    /// to shared memory, returning `true`. Any problem is answered with an
    /// error reply and the connection stays on the socket.
    pub fn accept_upgrade(&mut self, args: &[Vec<u8>]) -> ShmResult<bool> {
        let refusal = match self.validate_open(args) {
            Ok(name) => match SharedSegment::attach(&name) {
                Ok(segment) => {
                    // The acceptance must leave over the socket, before the switch.
                    self.obuf
                        .extend_from_slice(&Reply::Integer(SHM_OPEN_ACCEPTED).encode());
                    while !self.obuf.is_empty() {
                        match self.flush_pending() {
                            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
                            Err(e) => return Err(e.into()),
                            Ok(()) => {}
                        }
                    }
                    self.handshake.accept();
                    info!(name = segment.name(), "shared memory transport accepted");
                    self.transport = Transport::Shared(segment);
                    return Ok(true);
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "can't attach shared memory segment");
                    format!("ERR can't attach shared memory: {e}")
                }
            },
            Err(message) => message,
        };
        self.send_reply(&Reply::Error(refusal))?;
        Ok(false)
    }

    /// Drop any segment and fall back to the socket. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        match std::mem::take(&mut self.transport) {
            Transport::Pending(mut segment) | Transport::Shared(mut segment) => {
                segment.destroy();
                debug!("shared memory transport torn down");
            }
            Transport::Socket => {}
        }
        self.handshake.reset();
    }

    fn validate_open(&self, args: &[Vec<u8>]) -> Result<String, String> {
        if self.role != Role::Server {
            return Err("ERR only servers accept shared memory".to_string());
        }
        if !matches!(self.transport, Transport::Socket) {
            return Err("ERR shared memory already active".to_string());
        }
        let [version, name] = args else {
            return Err("ERR wrong number of arguments for 'shm.open' command".to_string());
        };
        let version = std::str::from_utf8(version)
            .ok()
            .and_then(|v| v.parse::<i64>().ok());
        if version != Some(SHM_PROTO_VERSION) {
            return Err("ERR unsupported shared memory protocol version".to_string());
        }
        String::from_utf8(name.clone()).map_err(|_| "ERR invalid segment name".to_string())
    }

    fn queue_command(&mut self, args: &[&[u8]]) {
        self.obuf.extend_from_slice(&encode_command(args));
        self.commands_sent += 1;
    }

    /// Decode the next reply from the wire. The flag is true for the
    /// handshake reply.
    fn receive_reply(&mut self) -> ShmResult<(Reply, bool)> {
        let result = self.decode_reply();
        match result {
            Ok(reply) => {
                self.replies_received += 1;
                let is_handshake = self.handshake.awaits(self.replies_received);
                if is_handshake {
                    self.finalize_handshake(Some(&reply));
                }
                Ok((reply, is_handshake))
            }
            Err(e) => {
                if !e.is_would_block() && self.handshake.state() == HandshakeState::CommandSent {
                    self.finalize_handshake(None);
                }
                Err(e)
            }
        }
    }

    fn decode_reply(&mut self) -> ShmResult<Reply> {
        loop {
            if self.ibuf.len() >= self.ibuf_wanted {
                match decode_reply(&self.ibuf)? {
                    Decoded::Complete(reply, used) => {
                        self.consume_input(used);
                        return Ok(reply);
                    }
                    Decoded::Partial { wanted } => self.ibuf_wanted = wanted,
                }
            }
            if self.fill_input()? == 0 {
                return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into());
            }
        }
    }

    fn consume_input(&mut self, used: usize) {
        self.ibuf.drain(..used);
        self.ibuf_wanted = 0;
    }

    fn fill_input(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; SHM_BUFFER_SIZE];
        let n = self.read_transport(&mut chunk)?;
        self.ibuf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Hand queued output to the transport.
    fn flush_pending(&mut self) -> std::io::Result<()> {
        let mut pending = std::mem::take(&mut self.obuf);
        let mut result = Ok(());
        let mut done = 0;
        while done < pending.len() {
            match self.write_transport(&pending[done..]) {
                Ok(0) => {
                    result = Err(ErrorKind::WriteZero.into());
                    break;
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        pending.drain(..done);
        self.obuf = pending;
        result
    }

    fn write_transport(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Transport::Shared(segment) = &mut self.transport {
            return self
                .io
                .write(segment, self.stream.as_fd(), self.config.blocking, buf);
        }
        self.stream.write(buf)
    }

    fn read_transport(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Transport::Shared(segment) = &mut self.transport {
            return self
                .io
                .read(segment, self.stream.as_fd(), self.config.blocking, buf);
        }
        self.stream.read(buf)
    }
}

impl<S: Read + Write + AsFd> Read for Connection<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.ibuf.is_empty() {
            let n = buf.len().min(self.ibuf.len());
            buf[..n].copy_from_slice(&self.ibuf[..n]);
            self.consume_input(n);
            return Ok(n);
        }
        self.read_transport(buf)
    }
}

impl<S: Read + Write + AsFd> Write for Connection<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.flush_pending()?;
        self.write_transport(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_pending()?;
        if matches!(self.transport, Transport::Shared(_)) {
            return Ok(());
        }
        self.stream.flush()
    }
}

impl<S: Read + Write + AsFd> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("mode", &self.mode())
            .field("handshake", &self.handshake.state())
            .field("transport", &self.transport)
            .finish()
    }
}
