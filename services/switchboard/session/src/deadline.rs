//! Scheduler keys for session deadlines.

use crate::session::SessionId;
use switchboard_scheduler::TimerKey;

/// Kind of deadline a session can have armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadlineKind {
    /// Handshake must finish before this fires
    FirstData,
    /// Next server-initiated PING is due
    Ping,
    /// No PING/PONG within the liveness window
    PingTimeout,
    /// Old transport did not drain in time
    UpgradeTimeout,
    /// Reply for one outstanding ack
    AckTimeout(u64),
}

/// `(kind, session)` pair; at most one timer is armed per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Deadline kind
    pub kind: DeadlineKind,
    /// Owning session
    pub sid: SessionId,
}

impl SessionKey {
    /// Key for `kind` on `sid`
    pub fn new(kind: DeadlineKind, sid: SessionId) -> Self {
        Self { kind, sid }
    }
}

impl TimerKey for SessionKey {
    type Owner = SessionId;

    fn owner(&self) -> SessionId {
        self.sid
    }
}
