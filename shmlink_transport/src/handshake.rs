//! Upgrade handshake state machine.
//!
//! ```text
//! Idle ──upgrade──► SegmentCreating ──command written──► CommandSent
//!                         │                                  │
//!                         └──► Failed ◄──no reply─────────────┤
//!                                        Rejected ◄──other────┤
//!                                     Established ◄──:1───────┘
//! ```
//!
//! The coordinator only tracks state and which reply answers the handshake
//! command; the segment itself is owned by the connection.

use crate::error::{ShmResult, TransportError};
use crate::resp::Reply;
use shmlink::consts::SHM_OPEN_ACCEPTED;

/// Progress of the upgrade handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// No upgrade requested
    #[default]
    Idle,
    /// Segment being created, nothing sent yet
    SegmentCreating,
    /// `SHM.OPEN` written, reply outstanding
    CommandSent,
    /// Peer accepted, traffic runs over shared memory
    Established,
    /// Peer answered with anything but the acceptance integer
    Rejected,
    /// Segment creation or the reply itself failed
    Failed,
}

impl HandshakeState {
    /// True for states a new upgrade may start from.
    pub fn can_upgrade(&self) -> bool {
        matches!(self, Self::Idle | Self::Rejected | Self::Failed)
    }
}

/// Tracks the handshake of one connection.
#[derive(Debug, Default)]
pub struct HandshakeCoordinator {
    state: HandshakeState,
    /// Sequence number of the reply answering `SHM.OPEN`
    reply_slot: Option<u64>,
}

impl HandshakeCoordinator {
    /// Coordinator in `Idle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Enter `SegmentCreating`.
    pub fn begin(&mut self) -> ShmResult<()> {
        if !self.state.can_upgrade() {
            return Err(TransportError::HandshakeInProgress);
        }
        self.state = HandshakeState::SegmentCreating;
        self.reply_slot = None;
        Ok(())
    }

    /// The command went out; its reply is reply number `slot`.
    pub fn command_sent(&mut self, slot: u64) {
        debug_assert_eq!(self.state, HandshakeState::SegmentCreating);
        self.state = HandshakeState::CommandSent;
        self.reply_slot = Some(slot);
    }

    /// True if reply number `slot` answers the handshake command.
    pub fn awaits(&self, slot: u64) -> bool {
        self.state == HandshakeState::CommandSent && self.reply_slot == Some(slot)
    }

    /// Settle the handshake from its reply (`None`: no reply could be read).
    ///
    /// Returns the new state. A no-op unless a reply is outstanding.
    pub fn resolve(&mut self, reply: Option<&Reply>) -> HandshakeState {
        if self.state != HandshakeState::CommandSent {
            return self.state;
        }
        self.reply_slot = None;
        self.state = match reply {
            Some(Reply::Integer(SHM_OPEN_ACCEPTED)) => HandshakeState::Established,
            Some(_) => HandshakeState::Rejected,
            None => HandshakeState::Failed,
        };
        self.state
    }

    /// Abort an upgrade before the command went out.
    pub fn fail(&mut self) {
        self.state = HandshakeState::Failed;
        self.reply_slot = None;
    }

    /// Server side: the peer's upgrade was accepted.
    pub fn accept(&mut self) {
        self.state = HandshakeState::Established;
        self.reply_slot = None;
    }

    /// Back to `Idle` after teardown.
    pub fn reset(&mut self) {
        self.state = HandshakeState::Idle;
        self.reply_slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepting_reply_establishes() {
        let mut hs = HandshakeCoordinator::new();
        hs.begin().unwrap();
        assert_eq!(hs.state(), HandshakeState::SegmentCreating);
        hs.command_sent(3);
        assert!(!hs.awaits(2));
        assert!(hs.awaits(3));

        assert_eq!(hs.resolve(Some(&Reply::Integer(1))), HandshakeState::Established);
        assert!(!hs.awaits(3));
        assert!(matches!(hs.begin(), Err(TransportError::HandshakeInProgress)));
    }

    #[test]
    fn test_other_replies_reject() {
        for reply in [
            Reply::Integer(0),
            Reply::Status("OK".into()),
            Reply::Error("ERR unknown command".into()),
            Reply::Bulk(None),
        ] {
            let mut hs = HandshakeCoordinator::new();
            hs.begin().unwrap();
            hs.command_sent(1);
            assert_eq!(hs.resolve(Some(&reply)), HandshakeState::Rejected);
        }
    }

    #[test]
    fn test_missing_reply_fails_and_allows_retry() {
        let mut hs = HandshakeCoordinator::new();
        hs.begin().unwrap();
        hs.command_sent(1);
        assert_eq!(hs.resolve(None), HandshakeState::Failed);
        assert!(hs.begin().is_ok());
    }

    #[test]
    fn test_resolve_is_noop_when_idle() {
        let mut hs = HandshakeCoordinator::new();
        assert_eq!(hs.resolve(Some(&Reply::Integer(1))), HandshakeState::Idle);
        hs.begin().unwrap();
        assert!(matches!(hs.begin(), Err(TransportError::HandshakeInProgress)));
    }
}
