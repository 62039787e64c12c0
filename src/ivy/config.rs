//! Cluster configuration.

use std::time::Duration;

use super::errors::IvyError;
use super::message::{ManagerId, NodeId};

/// How long a node waits for a page or an acknowledgement before it assumes
/// the primary is gone.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a bidding replica waits for a refusal before it declares victory.
pub const ELECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval of actor loops. Bounds how quickly a killed replica stops.
pub const TICK_INTERVAL: Duration = Duration::from_millis(5);

pub const DEFAULT_NODE_COUNT: u32 = 10;

/// The two replicas. `CM1` outranks `CM2`.
pub const MANAGER_IDS: [ManagerId; 2] = [ManagerId(1), ManagerId(2)];

#[derive(Debug, Clone)]
pub struct IvyConfig {
    /// Number of client nodes, numbered `1..=node_count`.
    pub node_count: u32,
    pub request_timeout: Duration,
    pub election_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for IvyConfig {
    fn default() -> Self {
        IvyConfig {
            node_count: DEFAULT_NODE_COUNT,
            request_timeout: REQUEST_TIMEOUT,
            election_timeout: ELECTION_TIMEOUT,
            tick_interval: TICK_INTERVAL,
        }
    }
}

impl IvyConfig {
    pub fn new(node_count: u32) -> Self {
        IvyConfig {
            node_count,
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        (1..=self.node_count).map(NodeId).collect()
    }

    pub fn validate(&self) -> Result<(), IvyError> {
        if self.node_count == 0 {
            return Err(IvyError::Config("node_count must be at least 1".into()));
        }
        if self.request_timeout.is_zero() || self.election_timeout.is_zero() {
            return Err(IvyError::Config("timeouts must be non-zero".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(IvyError::Config("tick_interval must be non-zero".into()));
        }
        Ok(())
    }
}
