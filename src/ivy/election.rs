//! Two-replica primary election.
//!
//! A bid wins by silence. The bidder sends `CM_ELECT_ME` and becomes primary
//! unless the peer answers `CM_ELECT_NO` before the deadline. The peer refuses
//! only when it is already primary or outranks the bidder; lower replica ids
//! outrank higher ones. With both replicas alive and responsive exactly one
//! of two concurrent bids survives.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::message::{ElectionId, ManagerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Serves client requests and drives replication.
    Primary,
    /// Mirrors the primary.
    Backup,
    /// A backup with a bid outstanding.
    Electing,
}

/// An outstanding bid.
#[derive(Debug, Clone)]
pub struct Ballot {
    pub id: ElectionId,
    pub deadline: Instant,
}

/// Ballot bookkeeping for one replica.
#[derive(Debug)]
pub struct Election {
    manager: ManagerId,
    counter: u64,
    ballot: Option<Ballot>,
}

impl Election {
    pub fn new(manager: ManagerId) -> Self {
        Election {
            manager,
            counter: 0,
            ballot: None,
        }
    }

    /// Fresh id, also used to tag victory announcements.
    pub fn next_id(&mut self) -> ElectionId {
        self.counter += 1;
        ElectionId {
            manager: self.manager,
            seq: self.counter,
        }
    }

    /// Open a bid. Returns `None` while another bid is still open.
    pub fn begin(&mut self, now: Instant, timeout: Duration) -> Option<ElectionId> {
        if self.ballot.is_some() {
            return None;
        }
        let id = self.next_id();
        self.ballot = Some(Ballot {
            id,
            deadline: now + timeout,
        });
        Some(id)
    }

    pub fn matches(&self, id: ElectionId) -> bool {
        self.ballot.as_ref().map_or(false, |b| b.id == id)
    }

    /// True once the deadline has passed without a refusal.
    pub fn expired(&self, now: Instant) -> bool {
        self.ballot.as_ref().map_or(false, |b| now >= b.deadline)
    }

    /// Time left before the open bid wins, if any.
    pub fn time_remaining(&self, now: Instant) -> Option<Duration> {
        self.ballot
            .as_ref()
            .map(|b| b.deadline.saturating_duration_since(now))
    }

    pub fn close(&mut self) -> Option<Ballot> {
        self.ballot.take()
    }
}

pub fn outranks(me: ManagerId, other: ManagerId) -> bool {
    me < other
}

/// Whether a replica in `role` must answer a bid from `bidder` with
/// `CM_ELECT_NO`. Otherwise it stays silent.
pub fn rejects_bid(role: ReplicaRole, me: ManagerId, bidder: ManagerId) -> bool {
    role == ReplicaRole::Primary || outranks(me, bidder)
}
