//! Cluster bootstrap: N nodes and two manager replicas on one mock network.
//!
//! This is the only surface callers drive. Replica crashes are simulated by
//! flipping the replica's alive flag on the network and stopping its thread;
//! a reboot starts a fresh, empty incarnation on fresh mailboxes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use tracing::{info, warn};

use super::config::{IvyConfig, MANAGER_IDS};
use super::election::ReplicaRole;
use super::errors::{IvyError, ProtocolError};
use super::manager::{spawn_manager, ManagerHandle, Replica, ReplicaState};
use super::message::{Address, ManagerId, NodeId, PageId};
use super::network::MockNetwork;
use super::node::{NodeHandle, NodeSnapshot};

pub struct IvySystem {
    config: IvyConfig,
    network: Arc<MockNetwork>,
    nodes: BTreeMap<NodeId, NodeHandle>,
    managers: Mutex<BTreeMap<ManagerId, ManagerHandle>>,
    stopped: bool,
}

impl IvySystem {
    /// Wire up the cluster. Both replicas start as backups; the first
    /// request elects a primary.
    pub fn start(config: IvyConfig) -> Result<Self, IvyError> {
        config.validate()?;
        let node_ids = config.node_ids();
        let network = MockNetwork::new(&node_ids, &MANAGER_IDS);

        let mut managers = BTreeMap::new();
        for id in MANAGER_IDS {
            let endpoint = network
                .manager_endpoint(id)
                .ok_or(IvyError::UnknownManager(id))?;
            let replica = Replica::new(
                id,
                peer_of(id),
                config.election_timeout,
                endpoint.outbox.clone(),
            );
            managers.insert(id, spawn_manager(replica, endpoint, config.tick_interval));
        }

        let mut nodes = BTreeMap::new();
        for id in node_ids {
            let endpoint = network.node_endpoint(id).ok_or(IvyError::UnknownNode(id))?;
            nodes.insert(id, NodeHandle::spawn(id, endpoint, &config));
        }

        info!(nodes = nodes.len(), replicas = managers.len(), "system started");
        Ok(IvySystem {
            config,
            network,
            nodes,
            managers: Mutex::new(managers),
            stopped: false,
        })
    }

    pub fn network(&self) -> &Arc<MockNetwork> {
        &self.network
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    fn node(&self, id: NodeId) -> Result<&NodeHandle, IvyError> {
        self.nodes.get(&id).ok_or(IvyError::UnknownNode(id))
    }

    fn lock_managers(&self) -> MutexGuard<'_, BTreeMap<ManagerId, ManagerHandle>> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the page is readable on `node`.
    pub fn node_read(&self, node: NodeId, page: PageId) -> Result<String, IvyError> {
        self.node(node)?.client_read(page)
    }

    /// Blocks until `node` owns the page and has written `data` into it.
    pub fn node_write(
        &self,
        node: NodeId,
        page: PageId,
        data: impl Into<String>,
    ) -> Result<(), IvyError> {
        self.node(node)?.client_write(page, data)
    }

    /// Crash a replica. Its state is lost; traffic to and from it is dropped.
    pub fn kill_manager(&self, id: ManagerId) -> Result<(), IvyError> {
        let mut managers = self.lock_managers();
        let handle = managers.get_mut(&id).ok_or(IvyError::UnknownManager(id))?;

        info!(replica = %id, "killing replica");
        self.network.kill(id);
        handle.kill();
        Ok(())
    }

    /// Restart a replica from scratch and wait until the election it starts
    /// has settled with a primary in place. A live replica is crashed first.
    pub fn reboot_manager(&self, id: ManagerId) -> Result<(), IvyError> {
        {
            let mut managers = self.lock_managers();
            let handle = managers.get_mut(&id).ok_or(IvyError::UnknownManager(id))?;
            if !handle.is_killed() {
                self.network.kill(id);
                handle.kill();
            }

            let endpoint = self
                .network
                .manager_endpoint(id)
                .ok_or(IvyError::UnknownManager(id))?;
            self.network.revive(id);
            let replica = Replica::rebooted(
                id,
                peer_of(id),
                self.config.election_timeout,
                endpoint.outbox.clone(),
                Instant::now(),
            );
            info!(replica = %id, "rebooting replica");
            managers.insert(id, spawn_manager(replica, endpoint, self.config.tick_interval));
        }

        self.await_settled(id);
        Ok(())
    }

    /// Wait until `id` has no bid open and some live replica is primary. An
    /// outranking backup that refused the bid needs one more election round.
    fn await_settled(&self, id: ManagerId) {
        let deadline = Instant::now() + self.config.election_timeout * 4;
        while Instant::now() < deadline {
            let states = self.manager_states();
            let electing = states
                .iter()
                .any(|s| s.id == id && s.role == ReplicaRole::Electing);
            let has_primary = states.iter().any(|s| s.role == ReplicaRole::Primary);
            if !electing && has_primary {
                return;
            }
            thread::sleep(self.config.tick_interval);
        }
        warn!(replica = %id, "no primary after reboot");
    }

    /// States of the live replicas.
    pub fn manager_states(&self) -> Vec<ReplicaState> {
        self.lock_managers()
            .values()
            .filter_map(|h| h.get_state())
            .collect()
    }

    /// The live primary, if there is exactly one.
    pub fn primary(&self) -> Option<ManagerId> {
        let primaries: Vec<ManagerId> = self
            .manager_states()
            .into_iter()
            .filter(|s| s.role == ReplicaRole::Primary)
            .map(|s| s.id)
            .collect();
        match primaries[..] {
            [only] => Some(only),
            _ => None,
        }
    }

    pub fn is_alive(&self, id: ManagerId) -> bool {
        self.network.is_alive(id)
    }

    pub fn node_snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.values().map(|n| n.snapshot()).collect()
    }

    /// Every protocol violation that halted an actor.
    pub fn fatal_errors(&self) -> Vec<(Address, ProtocolError)> {
        let mut errors: Vec<(Address, ProtocolError)> = self
            .manager_states()
            .into_iter()
            .filter_map(|s| s.fatal.map(|e| (Address::Manager(s.id), e)))
            .collect();
        errors.extend(
            self.nodes
                .values()
                .filter_map(|n| n.fatal_error().map(|e| (Address::Node(n.id()), e))),
        );
        errors
    }

    /// Stop every actor. Blocked client calls return [`IvyError::ShutDown`].
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for node in self.nodes.values_mut() {
            node.shutdown();
        }
        for handle in self.lock_managers().values_mut() {
            handle.stop();
        }
        info!(
            sent = self.network.messages_sent(),
            dropped = self.network.messages_dropped(),
            "system shut down"
        );
    }
}

impl Drop for IvySystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn peer_of(id: ManagerId) -> ManagerId {
    if id == MANAGER_IDS[0] {
        MANAGER_IDS[1]
    } else {
        MANAGER_IDS[0]
    }
}

