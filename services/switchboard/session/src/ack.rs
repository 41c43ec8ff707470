//! Acknowledgment correlation.
//!
//! Outbound events that want a reply get a per-session ack id and a
//! registration holding the reply's expected argument types and a oneshot
//! sender. A registration leaves the table exactly once, through
//! [`AckCorrelator::complete`], with whichever outcome gets there first: the
//! matching reply, its timeout, or the session closing.

use crate::deadline::{DeadlineKind, SessionKey};
use crate::session::SessionId;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use switchboard_scheduler::DeadlineScheduler;
use switchboard_wire::ArgSpec;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// How an ack registration ended
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// Peer replied with these arguments
    Reply(Vec<Value>),
    /// No reply before the deadline
    TimedOut,
    /// Session closed while waiting
    SessionClosed,
}

struct Registration {
    spec: ArgSpec,
    reply: oneshot::Sender<AckOutcome>,
}

#[derive(Default)]
struct AckTable {
    next_id: u64,
    pending: HashMap<u64, Registration>,
}

struct Inner {
    scheduler: DeadlineScheduler<SessionKey>,
    sessions: DashMap<SessionId, AckTable>,
}

/// Per-session ack id allocation and reply matching
#[derive(Clone)]
pub struct AckCorrelator {
    inner: Arc<Inner>,
}

impl AckCorrelator {
    /// Create a correlator arming timeouts on `scheduler`
    pub fn new(scheduler: DeadlineScheduler<SessionKey>) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                sessions: DashMap::new(),
            }),
        }
    }

    /// Allocate the next ack id of `sid` and wait for its outcome
    pub fn register(
        &self,
        sid: SessionId,
        spec: ArgSpec,
        timeout: Option<Duration>,
    ) -> (u64, oneshot::Receiver<AckOutcome>) {
        let (reply, outcome) = oneshot::channel();

        let ack_id = {
            let mut table = self.inner.sessions.entry(sid).or_default();
            let ack_id = table.next_id;
            table.next_id += 1;
            table.pending.insert(ack_id, Registration { spec, reply });
            ack_id
        };

        if let Some(timeout) = timeout {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            self.inner.scheduler.schedule(
                SessionKey::new(DeadlineKind::AckTimeout(ack_id), sid),
                timeout,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        if complete(&inner, sid, ack_id, AckOutcome::TimedOut) {
                            debug!(%sid, ack_id, "ack timed out");
                        }
                    }
                },
            );
        }

        trace!(%sid, ack_id, "ack registered");
        (ack_id, outcome)
    }

    /// Deliver a reply. Returns `false` if nothing waits for `ack_id`
    /// (timed out, already answered, or never issued).
    pub fn resolve(&self, sid: SessionId, ack_id: u64, args: Vec<Value>) -> bool {
        let resolved = self.complete(sid, ack_id, AckOutcome::Reply(args));
        if !resolved {
            debug!(%sid, ack_id, "reply for unknown ack dropped");
        }
        resolved
    }

    /// Expected argument types of a pending ack
    pub fn arg_spec(&self, sid: SessionId, ack_id: u64) -> Option<ArgSpec> {
        self.inner
            .sessions
            .get(&sid)
            .and_then(|table| table.pending.get(&ack_id).map(|r| r.spec.clone()))
    }

    /// Number of pending acks of `sid`
    pub fn pending(&self, sid: SessionId) -> usize {
        self.inner
            .sessions
            .get(&sid)
            .map(|table| table.pending.len())
            .unwrap_or(0)
    }

    /// Complete every registration of `sid` with
    /// [`AckOutcome::SessionClosed`] and forget the session
    pub fn release_session(&self, sid: SessionId) -> usize {
        let Some((_, table)) = self.inner.sessions.remove(&sid) else {
            return 0;
        };

        let released = table.pending.len();
        for (ack_id, registration) in table.pending {
            self.inner
                .scheduler
                .cancel(&SessionKey::new(DeadlineKind::AckTimeout(ack_id), sid));
            let _ = registration.reply.send(AckOutcome::SessionClosed);
        }
        if released > 0 {
            debug!(%sid, released, "released pending acks");
        }
        released
    }

    /// Single completion point for a registration
    pub fn complete(&self, sid: SessionId, ack_id: u64, outcome: AckOutcome) -> bool {
        complete(&self.inner, sid, ack_id, outcome)
    }
}

fn complete(inner: &Inner, sid: SessionId, ack_id: u64, outcome: AckOutcome) -> bool {
    let registration = match inner.sessions.get_mut(&sid) {
        Some(mut table) => table.pending.remove(&ack_id),
        None => None,
    };
    let Some(registration) = registration else {
        return false;
    };

    if !matches!(outcome, AckOutcome::TimedOut) {
        inner
            .scheduler
            .cancel(&SessionKey::new(DeadlineKind::AckTimeout(ack_id), sid));
    }
    // receiver may have been dropped by a caller that stopped waiting
    let _ = registration.reply.send(outcome);
    true
}
