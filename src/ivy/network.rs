//! In-process network for nodes and manager replicas.
//!
//! Every actor has a mailbox backed by a crossbeam channel. Replicas have two:
//! one for node traffic and a control mailbox for replication and election.
//! Messages are bincode frames; the receiving endpoint decodes them.
//!
//! A replica can be killed, which drops all traffic to and from it, and later
//! revived with fresh mailboxes so nothing addressed to its previous life is
//! ever delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{trace, warn};

use super::message::{Address, ManagerId, ManagerMessage, Message, NodeId};

/// An encoded message and who sent it.
pub type Frame = (Address, Vec<u8>);

struct ManagerMailbox {
    client: Sender<Frame>,
    control: Sender<Frame>,
}

/// The switchboard shared by every endpoint.
pub struct MockNetwork {
    node_senders: HashMap<NodeId, Sender<Frame>>,
    /// Taken when the node's endpoint is created.
    node_receivers: Mutex<HashMap<NodeId, Receiver<Frame>>>,
    /// Replaced on revive.
    manager_mailboxes: RwLock<HashMap<ManagerId, ManagerMailbox>>,
    alive: HashMap<ManagerId, Arc<AtomicBool>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MockNetwork {
    pub fn new(nodes: &[NodeId], managers: &[ManagerId]) -> Arc<Self> {
        let mut node_senders = HashMap::new();
        let mut node_receivers = HashMap::new();
        for &node in nodes {
            let (tx, rx) = unbounded();
            node_senders.insert(node, tx);
            node_receivers.insert(node, rx);
        }

        let alive = managers
            .iter()
            .map(|&m| (m, Arc::new(AtomicBool::new(true))))
            .collect();

        Arc::new(MockNetwork {
            node_senders,
            node_receivers: Mutex::new(node_receivers),
            manager_mailboxes: RwLock::new(HashMap::new()),
            alive,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        })
    }

    /// Take the endpoint of a node. Returns `None` for unknown nodes or if the
    /// endpoint was already taken.
    pub fn node_endpoint(self: &Arc<Self>, node: NodeId) -> Option<NodeEndpoint> {
        let rx = self
            .node_receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node)?;
        Some(NodeEndpoint {
            outbox: Outbox {
                from: Address::Node(node),
                network: Arc::clone(self),
            },
            rx,
        })
    }

    /// Create fresh mailboxes for a replica and return its endpoint. Any
    /// previous mailboxes are discarded together with their backlog.
    pub fn manager_endpoint(self: &Arc<Self>, manager: ManagerId) -> Option<ManagerEndpoint> {
        if !self.alive.contains_key(&manager) {
            return None;
        }
        let (client_tx, client_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        self.manager_mailboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                manager,
                ManagerMailbox {
                    client: client_tx,
                    control: control_tx,
                },
            );
        Some(ManagerEndpoint {
            outbox: Outbox {
                from: Address::Manager(manager),
                network: Arc::clone(self),
            },
            client_rx,
            control_rx,
        })
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.node_senders.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn manager_ids(&self) -> Vec<ManagerId> {
        let mut ids: Vec<ManagerId> = self.alive.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn kill(&self, manager: ManagerId) {
        if let Some(flag) = self.alive.get(&manager) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Mark a replica alive again. Call [`MockNetwork::manager_endpoint`]
    /// first so traffic lands in the new mailboxes.
    pub fn revive(&self, manager: ManagerId) {
        if let Some(flag) = self.alive.get(&manager) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_alive(&self, manager: ManagerId) -> bool {
        self.alive
            .get(&manager)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::SeqCst)
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::SeqCst)
    }

    fn deliver(&self, from: Address, to: Address, bytes: Vec<u8>, control: bool) -> bool {
        let from_dead = matches!(from, Address::Manager(m) if !self.is_alive(m));
        let to_dead = matches!(to, Address::Manager(m) if !self.is_alive(m));
        if from_dead || to_dead {
            self.messages_dropped.fetch_add(1, Ordering::SeqCst);
            return false;
        }

        let delivered = match to {
            Address::Node(node) => self
                .node_senders
                .get(&node)
                .map_or(false, |tx| tx.send((from, bytes)).is_ok()),
            Address::Manager(manager) => {
                let mailboxes = self
                    .manager_mailboxes
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                mailboxes.get(&manager).map_or(false, |mailbox| {
                    let tx = if control { &mailbox.control } else { &mailbox.client };
                    tx.send((from, bytes)).is_ok()
                })
            }
        };

        if delivered {
            self.messages_sent.fetch_add(1, Ordering::SeqCst);
        } else {
            self.messages_dropped.fetch_add(1, Ordering::SeqCst);
        }
        delivered
    }
}

/// Sending half of an endpoint. Cheap to clone and safe to share between the
/// threads of one actor.
#[derive(Clone)]
pub struct Outbox {
    from: Address,
    network: Arc<MockNetwork>,
}

impl Outbox {
    /// Send node traffic. Returns false if the message was dropped.
    pub fn send(&self, to: Address, msg: &Message) -> bool {
        trace!(from = %self.from, to = %to, kind = %msg.kind(), "send");
        match msg.encode() {
            Ok(bytes) => self.network.deliver(self.from, to, bytes, false),
            Err(e) => {
                warn!(from = %self.from, error = %e, "failed to encode message");
                false
            }
        }
    }

    /// Send replica-to-replica traffic on the control mailbox.
    pub fn send_control(&self, to: ManagerId, msg: &ManagerMessage) -> bool {
        trace!(from = %self.from, to = %to, kind = %msg.kind(), "send control");
        match msg.encode() {
            Ok(bytes) => self.network.deliver(self.from, Address::Manager(to), bytes, true),
            Err(e) => {
                warn!(from = %self.from, error = %e, "failed to encode control message");
                false
            }
        }
    }

    /// Send to every node. Returns how many deliveries succeeded.
    pub fn broadcast_nodes(&self, msg: &Message) -> usize {
        self.network
            .node_ids()
            .into_iter()
            .filter(|&node| self.send(Address::Node(node), msg))
            .count()
    }

    /// Send to every replica.
    pub fn broadcast_managers(&self, msg: &Message) -> usize {
        self.network
            .manager_ids()
            .into_iter()
            .filter(|&m| self.send(Address::Manager(m), msg))
            .count()
    }
}

fn decode_frame<M>(
    at: Address,
    frame: Frame,
    decode: impl Fn(&[u8]) -> Result<M, super::errors::WireError>,
) -> Option<(Address, M)> {
    let (from, bytes) = frame;
    match decode(&bytes) {
        Ok(msg) => Some((from, msg)),
        Err(e) => {
            warn!(at = %at, from = %from, error = %e, "dropping undecodable frame");
            None
        }
    }
}

/// What came out of a mailbox.
#[derive(Debug)]
pub enum Received<M> {
    Message(Address, M),
    /// A frame arrived but could not be decoded.
    Garbled,
    Timeout,
    /// Every sender is gone.
    Closed,
}

fn receive<M>(
    at: Address,
    rx: &Receiver<Frame>,
    timeout: Duration,
    decode: impl Fn(&[u8]) -> Result<M, super::errors::WireError>,
) -> Received<M> {
    match rx.recv_timeout(timeout) {
        Ok(frame) => match decode_frame(at, frame, decode) {
            Some((from, msg)) => Received::Message(from, msg),
            None => Received::Garbled,
        },
        Err(RecvTimeoutError::Timeout) => Received::Timeout,
        Err(RecvTimeoutError::Disconnected) => Received::Closed,
    }
}

pub struct NodeEndpoint {
    pub outbox: Outbox,
    rx: Receiver<Frame>,
}

impl NodeEndpoint {
    pub fn recv_timeout(&self, timeout: Duration) -> Received<Message> {
        receive(self.outbox.from, &self.rx, timeout, Message::decode)
    }

    /// Non-blocking receive; garbled frames are skipped.
    #[cfg(test)]
    pub fn try_recv(&self) -> Option<(Address, Message)> {
        while let Ok(frame) = self.rx.try_recv() {
            if let Some(decoded) = decode_frame(self.outbox.from, frame, Message::decode) {
                return Some(decoded);
            }
        }
        None
    }
}

pub struct ManagerEndpoint {
    pub outbox: Outbox,
    client_rx: Receiver<Frame>,
    control_rx: Receiver<Frame>,
}

impl ManagerEndpoint {
    pub fn client_receiver(&self) -> &Receiver<Frame> {
        &self.client_rx
    }

    pub fn control_receiver(&self) -> &Receiver<Frame> {
        &self.control_rx
    }

    pub fn decode_client(&self, frame: Frame) -> Option<(Address, Message)> {
        decode_frame(self.outbox.from, frame, Message::decode)
    }

    pub fn decode_control(&self, frame: Frame) -> Option<(Address, ManagerMessage)> {
        decode_frame(self.outbox.from, frame, ManagerMessage::decode)
    }

    pub fn try_recv_control(&self) -> Option<(Address, ManagerMessage)> {
        while let Ok(frame) = self.control_rx.try_recv() {
            if let Some(decoded) = self.decode_control(frame) {
                return Some(decoded);
            }
        }
        None
    }

    #[cfg(test)]
    pub fn try_recv_client(&self) -> Option<(Address, Message)> {
        while let Ok(frame) = self.client_rx.try_recv() {
            if let Some(decoded) = self.decode_client(frame) {
                return Some(decoded);
            }
        }
        None
    }
}
