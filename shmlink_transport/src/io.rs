//! Socket-like read/write over a shared segment.
//!
//! [`SharedIo`] reproduces the contract of `write(2)` / `read(2)` on a
//! stream socket, so a RESP decoder written against a socket works
//! unmodified on top of the ring buffers:
//!
//! - writes of at most [`ATOMIC_WRITE_MAX`] bytes land completely or not at all
//! - a read returns as soon as any data is available
//! - `WouldBlock` when no progress is possible and the peer is alive
//! - `BrokenPipe` on write, `Ok(0)` on read, once the peer is gone
//!
//! Blocking calls busy-poll; the [`PollStrategy`] decides what an empty pass
//! costs. There is no timeout: only completion, a non-blocking single pass,
//! or a dead peer end the loop.

use crate::liveness::{Liveness, LivenessProbe};
use crate::segment::SharedSegment;
use shmlink::config::{PollStrategy, TransportConfig};
use shmlink::consts::ATOMIC_WRITE_MAX;
use std::io::{Error, ErrorKind};
use std::os::fd::BorrowedFd;

/// Read/write engine of a shared memory connection.
#[derive(Debug, Clone, Copy)]
pub struct SharedIo {
    probe: LivenessProbe,
    poll: PollStrategy,
}

impl SharedIo {
    /// Create an engine with an explicit probe and polling strategy.
    pub fn new(probe: LivenessProbe, poll: PollStrategy) -> Self {
        Self { probe, poll }
    }

    /// Create an engine from transport settings.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(LivenessProbe::new(config.liveness_interval), config.poll)
    }

    /// Liveness probe in use.
    pub fn probe(&self) -> &LivenessProbe {
        &self.probe
    }

    /// Write `buf` into the outbound ring with socket `write` semantics.
    pub fn write(
        &self,
        segment: &mut SharedSegment,
        socket: BorrowedFd<'_>,
        blocking: bool,
        buf: &[u8],
    ) -> std::io::Result<usize> {
        let Some(mut tx) = segment.outbound() else {
            return Err(ErrorKind::NotConnected.into());
        };

        let atomic = buf.len() <= ATOMIC_WRITE_MAX;
        let mut iteration = 0u64;
        let mut written = 0usize;
        let mut broken = false;

        loop {
            if self.probe.check(socket, blocking, iteration) == Liveness::Dead {
                broken = true;
                break;
            }
            iteration += 1;

            let free = tx.free_space();
            if atomic && free < buf.len() {
                if !blocking {
                    break;
                }
                idle(self.poll, iteration);
                continue;
            }
            if free > 0 {
                let chunk = free.min(buf.len() - written);
                written += tx.write(&buf[written..written + chunk]);
            } else if blocking {
                idle(self.poll, iteration);
            }

            if written >= buf.len() || !blocking {
                break;
            }
        }

        if written != 0 || buf.is_empty() {
            // Like write(2) hit by EPIPE mid-way: report the partial count.
            Ok(written)
        } else if broken {
            Err(Error::from(ErrorKind::BrokenPipe))
        } else {
            Err(Error::from(ErrorKind::WouldBlock))
        }
    }

    /// Read from the inbound ring with socket `read` semantics.
    pub fn read(
        &self,
        segment: &mut SharedSegment,
        socket: BorrowedFd<'_>,
        blocking: bool,
        buf: &mut [u8],
    ) -> std::io::Result<usize> {
        let Some(mut rx) = segment.inbound() else {
            return Err(ErrorKind::NotConnected.into());
        };
        if buf.is_empty() {
            return Ok(0);
        }

        let mut iteration = 0u64;
        let mut read = 0usize;
        let mut broken = false;

        loop {
            if self.probe.check(socket, blocking, iteration) == Liveness::Dead {
                broken = true;
                break;
            }
            iteration += 1;

            if rx.used_space() > 0 {
                read = rx.read(buf);
                break;
            }
            if !blocking {
                break;
            }
            idle(self.poll, iteration);
        }

        if read != 0 {
            Ok(read)
        } else if broken {
            // Orderly shutdown as a socket reports it.
            Ok(0)
        } else {
            Err(Error::from(ErrorKind::WouldBlock))
        }
    }
}

impl Default for SharedIo {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

#[inline]
fn idle(poll: PollStrategy, iteration: u64) {
    match poll {
        PollStrategy::Spin => {}
        PollStrategy::Yield => std::thread::yield_now(),
        PollStrategy::Backoff { spins } => {
            if iteration <= u64::from(spins) {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmlink::consts::SHM_BUFFER_SIZE;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (SharedSegment, SharedSegment) {
        let client = SharedSegment::create(0o600).unwrap();
        let server = SharedSegment::attach(client.name()).unwrap();
        (client, server)
    }

    #[test]
    fn test_nonblocking_atomic_write_would_block() {
        let (mut client, _server) = pair();
        let (sock, _peer) = UnixStream::pair().unwrap();
        let io = SharedIo::default();

        let filler = vec![0u8; SHM_BUFFER_SIZE - 5];
        assert_eq!(
            io.write(&mut client, sock.as_fd(), false, &filler).unwrap(),
            SHM_BUFFER_SIZE - 5
        );

        let err = io.write(&mut client, sock.as_fd(), false, b"0123456789").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert_eq!(client.outbound().unwrap().free_space(), 5);
    }

    #[test]
    fn test_blocking_atomic_write_waits_for_room() {
        let (mut client, mut server) = pair();
        let (sock, _peer) = UnixStream::pair().unwrap();
        let io = SharedIo::default();

        let filler = vec![0u8; SHM_BUFFER_SIZE - 5];
        io.write(&mut client, sock.as_fd(), false, &filler).unwrap();

        let reader = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            // Only 5 bytes free: nothing of the 10 byte write may be in yet.
            assert_eq!(
                server.inbound().unwrap().used_space(),
                SHM_BUFFER_SIZE - 5
            );

            let mut received = Vec::new();
            let mut buf = [0u8; 2];
            while received.len() < SHM_BUFFER_SIZE + 5 {
                let n = server.inbound().unwrap().read(&mut buf);
                received.extend_from_slice(&buf[..n]);
                if n == 0 {
                    std::thread::yield_now();
                }
            }
            received
        });

        assert_eq!(
            io.write(&mut client, sock.as_fd(), true, b"0123456789").unwrap(),
            10
        );
        let received = reader.join().unwrap();
        assert_eq!(&received[SHM_BUFFER_SIZE - 5..], b"0123456789");
    }

    #[test]
    fn test_nonblocking_large_write_is_partial() {
        let (mut client, _server) = pair();
        let (sock, _peer) = UnixStream::pair().unwrap();
        let io = SharedIo::default();

        let big = vec![7u8; SHM_BUFFER_SIZE + 100];
        assert_eq!(
            io.write(&mut client, sock.as_fd(), false, &big).unwrap(),
            SHM_BUFFER_SIZE
        );
        let err = io.write(&mut client, sock.as_fd(), false, &big).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_zero_length_calls() {
        let (mut client, _server) = pair();
        let (sock, _peer) = UnixStream::pair().unwrap();
        let io = SharedIo::default();

        assert_eq!(io.write(&mut client, sock.as_fd(), true, &[]).unwrap(), 0);
        assert_eq!(io.read(&mut client, sock.as_fd(), true, &mut []).unwrap(), 0);
    }

    #[test]
    fn test_read_short_circuits() {
        let (mut client, mut server) = pair();
        let (sock, _peer) = UnixStream::pair().unwrap();
        let io = SharedIo::default();

        io.write(&mut server, sock.as_fd(), true, b"abc").unwrap();
        let mut buf = [0u8; 64];
        // Blocking, but returns with what is there.
        assert_eq!(io.read(&mut client, sock.as_fd(), true, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        let err = io.read(&mut client, sock.as_fd(), false, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_dead_peer_reports_broken_pipe_and_eof() {
        let (mut client, _server) = pair();
        let (sock, peer) = UnixStream::pair().unwrap();
        drop(peer);
        let io = SharedIo::new(LivenessProbe::new(16), PollStrategy::Spin);

        let filler = vec![1u8; SHM_BUFFER_SIZE];
        assert_eq!(
            io.write(&mut client, sock.as_fd(), true, &filler).unwrap(),
            SHM_BUFFER_SIZE
        );

        // Ring full: the blocking write spins until the probe fires.
        let err = io.write(&mut client, sock.as_fd(), true, b"more").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);

        let mut buf = [0u8; 8];
        assert_eq!(io.read(&mut client, sock.as_fd(), true, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_partial_write_survives_dead_peer() {
        let (mut client, _server) = pair();
        let (sock, peer) = UnixStream::pair().unwrap();
        drop(peer);
        let io = SharedIo::new(LivenessProbe::new(8), PollStrategy::Yield);

        let big = vec![2u8; SHM_BUFFER_SIZE + 10];
        assert_eq!(
            io.write(&mut client, sock.as_fd(), true, &big).unwrap(),
            SHM_BUFFER_SIZE
        );
    }

    #[test]
    fn test_backoff_strategy_transfers() {
        let (mut client, mut server) = pair();
        let (sock, _peer) = UnixStream::pair().unwrap();
        let io = SharedIo::new(LivenessProbe::default(), PollStrategy::Backoff { spins: 4 });

        io.write(&mut client, sock.as_fd(), true, b"hello").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(io.read(&mut server, sock.as_fd(), true, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }
}
