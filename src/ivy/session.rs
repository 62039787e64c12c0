//! Completed-request table for idempotent retry.
//!
//! A node reuses its request id across every retransmission, and its requests
//! are strictly sequential. Remembering the last completed request per node is
//! therefore enough to tell a retry of finished work from new work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::message::{NodeId, RequestId, RequestKind};

/// Last completed request of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub last_seq: u64,
    pub kind: RequestKind,
}

/// How an incoming request id relates to what has already completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retransmission {
    /// Not seen before.
    New,
    /// Exactly the last completed request; re-acknowledge it.
    Duplicate(RequestKind),
    /// Older than the last completed request; drop it.
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMap {
    sessions: BTreeMap<NodeId, ClientSession>,
}

impl SessionMap {
    pub fn new() -> Self {
        SessionMap {
            sessions: BTreeMap::new(),
        }
    }

    pub fn check(&self, req: RequestId) -> Retransmission {
        match self.sessions.get(&req.node) {
            Some(session) if req.seq == session.last_seq => Retransmission::Duplicate(session.kind),
            Some(session) if req.seq < session.last_seq => Retransmission::Stale,
            _ => Retransmission::New,
        }
    }

    /// Record a completed request. Older completions never overwrite newer ones.
    pub fn record(&mut self, req: RequestId, kind: RequestKind) {
        let newer = self
            .sessions
            .get(&req.node)
            .map_or(true, |s| req.seq > s.last_seq);
        if newer {
            self.sessions.insert(
                req.node,
                ClientSession {
                    last_seq: req.seq,
                    kind,
                },
            );
        }
    }

    #[cfg(test)]
    pub fn last_sequence(&self, node: NodeId) -> u64 {
        self.sessions.get(&node).map(|s| s.last_seq).unwrap_or(0)
    }

    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }
}
