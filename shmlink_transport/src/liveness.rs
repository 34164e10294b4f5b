//! Sampled peer liveness check.
//!
//! Ring traffic cannot tell a slow peer from a dead one. The socket the
//! connection was established on can: once the peer process is gone the
//! kernel closes its end and the socket turns readable with EOF. Polling it
//! costs a system call, so only every `interval`-th loop iteration checks.

use crate::platform::{peek_byte, poll_readable, set_fd_blocking};
use shmlink::consts::LIVENESS_CHECK_INTERVAL;
use std::io::ErrorKind;
use std::os::fd::BorrowedFd;
use tracing::warn;

/// Outcome of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Peer presumed alive (or not checked on this iteration)
    Alive,
    /// Peer presumed gone
    Dead,
}

/// Checks the socket of a shared memory connection every `interval` iterations.
#[derive(Debug, Clone, Copy)]
pub struct LivenessProbe {
    interval: u64,
}

impl LivenessProbe {
    /// Create a probe that checks every `interval` iterations (minimum 1).
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
        }
    }

    /// Iterations between two checks.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// True when `iteration` performs an actual check.
    #[inline]
    pub fn is_sampled(&self, iteration: u64) -> bool {
        iteration != 0 && iteration % self.interval == 0
    }

    /// Liveness at loop `iteration` of a transport call.
    ///
    /// Iteration 0 and every iteration not a multiple of the interval report
    /// [`Liveness::Alive`] without touching the socket.
    #[inline]
    pub fn check(&self, socket: BorrowedFd<'_>, blocking: bool, iteration: u64) -> Liveness {
        if !self.is_sampled(iteration) {
            return Liveness::Alive;
        }
        let liveness = Self::probe(socket, blocking);
        if liveness == Liveness::Dead {
            warn!(iteration, "peer connection lost");
        }
        liveness
    }

    /// Unconditional check of `socket`.
    ///
    /// A readable socket is either at EOF or holds bytes nobody expects
    /// while the connection runs over shared memory; both count as dead.
    pub fn probe(socket: BorrowedFd<'_>, blocking: bool) -> Liveness {
        match poll_readable(socket) {
            Ok(false) => return Liveness::Alive,
            Ok(true) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Liveness::Alive,
            // Even on ENOMEM: dropping the connection beats blocking forever.
            Err(_) => return Liveness::Dead,
        }

        // Peek under O_NONBLOCK so a spurious readiness cannot block.
        if blocking {
            let _ = set_fd_blocking(socket, false);
        }
        let peeked = peek_byte(socket);
        if blocking {
            let _ = set_fd_blocking(socket, true);
        }

        match peeked {
            Ok(_) => Liveness::Dead,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Liveness::Alive
            }
            Err(_) => Liveness::Dead,
        }
    }
}

impl Default for LivenessProbe {
    fn default() -> Self {
        Self::new(LIVENESS_CHECK_INTERVAL)
    }
}
