//! Central manager replica.
//!
//! A replica is a single-threaded actor that owns its directory outright.
//! Node requests enter a FIFO work queue and are admitted one at a time;
//! replication and election traffic arrives on a separate control mailbox
//! that the runner always drains first.
//!
//! # Invariants
//!
//! 1. **One request in flight**: the primary drives at most one request at a
//!    time, so requests on the same page are totally ordered by admission.
//! 2. **Replicate before side effects**: the backup learns about a request
//!    before any node is asked to act on it, and about its completion before
//!    the requestor is acknowledged.
//! 3. **Exactly-once completion**: a retried request id is recognised through
//!    the queue, the in-flight slot, or the session table, and never
//!    re-executed.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::directory::{Directory, DirectorySnapshot};
use super::election::{rejects_bid, Election, ReplicaRole};
use super::errors::ProtocolError;
use super::message::{
    Address, ElectionId, ManagerId, ManagerMessage, Message, MsgType, NodeId, PageId,
    ReplicaSnapshot, RequestId, RequestKind, RequestRecord,
};
use super::network::{Frame, ManagerEndpoint, Outbox};
use super::session::{Retransmission, SessionMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    HandlingRead,
    HandlingWrite,
}

/// Progress of the in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    /// Replicated from the primary. Restarts from the first step on promotion.
    Mirrored,
    AwaitReadConfirm,
    Invalidating {
        pending: BTreeSet<NodeId>,
        confirmed: BTreeSet<NodeId>,
    },
    AwaitWriteConfirm,
}

#[derive(Debug, Clone)]
struct InFlight {
    record: RequestRecord,
    step: Step,
}

/// State snapshot from a replica for verification.
#[derive(Debug, Clone)]
pub struct ReplicaState {
    pub id: ManagerId,
    pub role: ReplicaRole,
    pub request_state: RequestState,
    pub current: Option<RequestRecord>,
    pub queued: usize,
    pub directory: DirectorySnapshot,
    pub sessions: SessionMap,
    pub synced: bool,
    pub fatal: Option<ProtocolError>,
}

pub struct Replica {
    id: ManagerId,
    peer: ManagerId,
    role: ReplicaRole,
    election_timeout: Duration,
    outbox: Outbox,
    directory: Directory,
    sessions: SessionMap,
    queue: VecDeque<RequestRecord>,
    current: Option<InFlight>,
    /// False after a reboot until a full state transfer arrives. An unsynced
    /// replica cannot tell a forgotten request from a bogus one.
    synced: bool,
    election: Election,
    fatal: Option<ProtocolError>,
}

impl Replica {
    pub fn new(id: ManagerId, peer: ManagerId, election_timeout: Duration, outbox: Outbox) -> Self {
        Replica {
            id,
            peer,
            role: ReplicaRole::Backup,
            election_timeout,
            outbox,
            directory: Directory::new(),
            sessions: SessionMap::new(),
            queue: VecDeque::new(),
            current: None,
            synced: true,
            election: Election::new(id),
            fatal: None,
        }
    }

    /// A replica coming back from a crash: empty, unsynced, and already
    /// bidding so the cluster is never left without a primary.
    pub fn rebooted(
        id: ManagerId,
        peer: ManagerId,
        election_timeout: Duration,
        outbox: Outbox,
        now: Instant,
    ) -> Self {
        let mut replica = Replica::new(id, peer, election_timeout, outbox);
        replica.synced = false;
        replica.start_election(now, true);
        replica
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    pub fn is_halted(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn halt(&mut self, err: ProtocolError) {
        error!(replica = %self.id, error = %err, "protocol violation, halting replica");
        self.fatal = Some(err);
    }

    pub fn request_state(&self) -> RequestState {
        match self.current.as_ref().map(|c| c.record.kind) {
            None => RequestState::Idle,
            Some(RequestKind::Read) => RequestState::HandlingRead,
            Some(RequestKind::Write) => RequestState::HandlingWrite,
        }
    }

    pub fn state(&self) -> ReplicaState {
        ReplicaState {
            id: self.id,
            role: self.role,
            request_state: self.request_state(),
            current: self.current_record(),
            queued: self.queue.len(),
            directory: self.directory.snapshot(),
            sessions: self.sessions.clone(),
            synced: self.synced,
            fatal: self.fatal.clone(),
        }
    }

    /// How long the runner may sleep before [`Replica::tick`] has work.
    pub fn next_wakeup(&self, now: Instant) -> Option<Duration> {
        self.election.time_remaining(now)
    }

    fn current_record(&self) -> Option<RequestRecord> {
        self.current.as_ref().map(|c| c.record)
    }

    fn set_step(&mut self, step: Step) {
        if let Some(current) = self.current.as_mut() {
            current.step = step;
        }
    }

    fn snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            directory: self.directory.snapshot(),
            sessions: self.sessions.clone(),
            current: self.current_record(),
        }
    }

    fn send_node(&self, node: NodeId, msg: Message) {
        if !self.outbox.send(Address::Node(node), &msg) {
            debug!(replica = %self.id, node = %node, kind = %msg.kind(), "send failed");
        }
    }

    fn replicate(&self, msg: ManagerMessage) {
        if !self.outbox.send_control(self.peer, &msg) {
            debug!(replica = %self.id, peer = %self.peer, kind = %msg.kind(), "peer unreachable, not replicated");
        }
    }

    // ========================================================================
    // NODE TRAFFIC
    // ========================================================================

    pub fn handle_node_message(
        &mut self,
        from: Address,
        msg: Message,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        let kind = msg.kind();
        let Address::Node(node) = from else {
            return Err(ProtocolError::UnexpectedMessage { at: Address::Manager(self.id), kind });
        };

        match msg {
            Message::Elect { req } => {
                self.on_elect_trigger(req, now);
                Ok(())
            }
            Message::ReadRequest { .. }
            | Message::WriteRequest { .. }
            | Message::ReadConfirm { .. }
            | Message::WriteConfirm { .. }
            | Message::InvalidateConfirm { .. }
                if self.role != ReplicaRole::Primary =>
            {
                // The sender still believes we are primary; it will time out
                // and re-elect.
                warn!(replica = %self.id, from = %node, kind = %kind, role = ?self.role, "not primary, dropping");
                Ok(())
            }
            Message::ReadRequest { req, page } => self.on_request(RequestRecord {
                req,
                kind: RequestKind::Read,
                page,
            }),
            Message::WriteRequest { req, page } => self.on_request(RequestRecord {
                req,
                kind: RequestKind::Write,
                page,
            }),
            Message::ReadConfirm { req, page } => self.on_read_confirm(req, page),
            Message::WriteConfirm { req, page } => self.on_write_confirm(req, page),
            Message::InvalidateConfirm { req, page } => self.on_invalidate_confirm(node, req, page),
            _ => Err(ProtocolError::UnexpectedMessage { at: Address::Manager(self.id), kind }),
        }
    }

    fn on_request(&mut self, record: RequestRecord) -> Result<(), ProtocolError> {
        if self.sessions.check(record.req) != Retransmission::New {
            debug!(replica = %self.id, req = %record.req, "request already completed, dropping");
            return Ok(());
        }

        let in_flight = self.current_record().map_or(false, |c| c.req == record.req);
        if in_flight || self.queue.iter().any(|q| q.req == record.req) {
            debug!(replica = %self.id, req = %record.req, "retransmission of admitted request");
            return Ok(());
        }

        self.queue.push_back(record);
        self.admit_next()
    }

    /// Start queued requests until one is left waiting on a node.
    fn admit_next(&mut self) -> Result<(), ProtocolError> {
        while self.current.is_none() && self.role == ReplicaRole::Primary {
            let Some(record) = self.queue.pop_front() else {
                break;
            };
            match record.kind {
                RequestKind::Read => self.start_read(record)?,
                RequestKind::Write => self.start_write(record),
            }
        }
        Ok(())
    }

    fn start_read(&mut self, record: RequestRecord) -> Result<(), ProtocolError> {
        let RequestRecord { req, page, .. } = record;
        let reader = record.requestor();

        let Some(owner) = self.directory.owner(page) else {
            warn!(replica = %self.id, req = %req, page = %page, "read of a page that was never written");
            self.send_node(reader, Message::PageNotFound { req, page });
            return Ok(());
        };
        if owner == reader {
            return Err(ProtocolError::OwnerReadsOwnPage { owner, page });
        }

        self.directory.add_reader(page, reader)?;
        self.current = Some(InFlight {
            record,
            step: Step::AwaitReadConfirm,
        });
        self.replicate(ManagerMessage::ReadRequestReceived {
            req,
            page,
            directory: self.directory.snapshot(),
        });

        info!(replica = %self.id, req = %req, page = %page, reader = %reader, owner = %owner, "read admitted");
        self.send_node(owner, Message::ReadForward { req, reader, page });
        Ok(())
    }

    fn start_write(&mut self, record: RequestRecord) {
        self.directory.ensure(record.page);
        self.current = Some(InFlight {
            record,
            step: Step::Mirrored,
        });
        self.replicate(ManagerMessage::WriteRequestReceived {
            req: record.req,
            page: record.page,
            directory: self.directory.snapshot(),
        });

        info!(replica = %self.id, req = %record.req, page = %record.page, writer = %record.requestor(), "write admitted");
        self.begin_invalidation();
    }

    /// Revoke every read copy of the in-flight write's page.
    fn begin_invalidation(&mut self) {
        let Some(record) = self.current_record() else {
            return;
        };
        let pending = self.directory.copy_set(record.page);
        let targets: Vec<NodeId> = pending.iter().copied().collect();
        self.set_step(Step::Invalidating {
            pending,
            confirmed: BTreeSet::new(),
        });

        if targets.is_empty() {
            self.forward_write();
            return;
        }
        for node in targets {
            self.send_node(
                node,
                Message::Invalidate {
                    req: record.req,
                    writer: record.requestor(),
                    page: record.page,
                },
            );
        }
    }

    fn forward_write(&mut self) {
        let Some(record) = self.current_record() else {
            return;
        };
        self.set_step(Step::AwaitWriteConfirm);

        let writer = record.requestor();
        match self.directory.owner(record.page) {
            None => self.send_node(writer, Message::WriteInit { req: record.req, page: record.page }),
            Some(owner) => self.send_node(
                owner,
                Message::WriteForward {
                    req: record.req,
                    writer,
                    page: record.page,
                },
            ),
        }
    }

    fn on_invalidate_confirm(
        &mut self,
        node: NodeId,
        req: RequestId,
        page: PageId,
    ) -> Result<(), ProtocolError> {
        let Some(current) = self.current.as_mut().filter(|c| c.record.req == req) else {
            debug!(replica = %self.id, req = %req, from = %node, "stale invalidation confirm");
            return Ok(());
        };
        let Step::Invalidating { pending, confirmed } = &mut current.step else {
            debug!(replica = %self.id, req = %req, from = %node, "late invalidation confirm");
            return Ok(());
        };

        if pending.remove(&node) {
            confirmed.insert(node);
        } else if confirmed.contains(&node) {
            debug!(replica = %self.id, req = %req, from = %node, "duplicate invalidation confirm");
            return Ok(());
        } else {
            return Err(ProtocolError::ConfirmationOverrun { req, from: node, page });
        }

        if pending.is_empty() {
            self.forward_write();
        }
        Ok(())
    }

    fn on_read_confirm(&mut self, req: RequestId, page: PageId) -> Result<(), ProtocolError> {
        let matching = self
            .current_record()
            .filter(|r| r.req == req && r.kind == RequestKind::Read);
        let Some(record) = matching else {
            return self.answer_retransmitted_confirm(req, RequestKind::Read, page);
        };

        self.current = None;
        self.sessions.record(req, RequestKind::Read);
        self.replicate(ManagerMessage::ReadConfirmReceived {
            req,
            page: record.page,
            directory: self.directory.snapshot(),
        });

        info!(replica = %self.id, req = %req, page = %record.page, "read complete");
        self.send_node(record.requestor(), Message::ReadConfirmAck { req, page: record.page });
        self.admit_next()
    }

    fn on_write_confirm(&mut self, req: RequestId, page: PageId) -> Result<(), ProtocolError> {
        let matching = self
            .current_record()
            .filter(|r| r.req == req && r.kind == RequestKind::Write);
        let Some(record) = matching else {
            return self.answer_retransmitted_confirm(req, RequestKind::Write, page);
        };

        // A writer holding the page implies every read copy was already
        // revoked, even if re-sent invalidations after a takeover are still
        // outstanding.
        let writer = record.requestor();
        self.directory.transfer_ownership(record.page, writer);
        self.current = None;
        self.sessions.record(req, RequestKind::Write);
        self.replicate(ManagerMessage::WriteConfirmReceived {
            req,
            page: record.page,
            directory: self.directory.snapshot(),
        });

        info!(replica = %self.id, req = %req, page = %record.page, owner = %writer, "write complete");
        self.send_node(writer, Message::WriteConfirmAck { req, page: record.page });
        self.admit_next()
    }

    fn answer_retransmitted_confirm(
        &mut self,
        req: RequestId,
        kind: RequestKind,
        page: PageId,
    ) -> Result<(), ProtocolError> {
        match self.sessions.check(req) {
            Retransmission::Duplicate(done) if done == kind => {
                info!(replica = %self.id, req = %req, "re-acknowledging completed request");
                let ack = match kind {
                    RequestKind::Read => Message::ReadConfirmAck { req, page },
                    RequestKind::Write => Message::WriteConfirmAck { req, page },
                };
                self.send_node(req.node, ack);
                Ok(())
            }
            Retransmission::Stale => {
                debug!(replica = %self.id, req = %req, "stale confirmation");
                Ok(())
            }
            _ if !self.synced => {
                // The requestor already holds the page; adopt what it did.
                warn!(replica = %self.id, req = %req, page = %page, "adopting confirmation for request lost in reboot");
                let node = req.node;
                let ack = match kind {
                    RequestKind::Read => {
                        if self.directory.owner(page).map_or(false, |o| o != node) {
                            self.directory.add_reader(page, node)?;
                        }
                        Message::ReadConfirmAck { req, page }
                    }
                    RequestKind::Write => {
                        self.directory.transfer_ownership(page, node);
                        Message::WriteConfirmAck { req, page }
                    }
                };
                self.sessions.record(req, kind);
                self.send_node(node, ack);
                Ok(())
            }
            _ => Err(ProtocolError::UnknownConfirmation { replica: self.id, req }),
        }
    }

    // ========================================================================
    // REPLICATION AND ELECTION
    // ========================================================================

    pub fn handle_control_message(
        &mut self,
        from: Address,
        msg: ManagerMessage,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        let kind = msg.kind();
        let Address::Manager(peer) = from else {
            return Err(ProtocolError::UnexpectedMessage { at: Address::Manager(self.id), kind });
        };

        match msg {
            ManagerMessage::ElectMe { election, reviving } => {
                self.on_elect_me(peer, election, reviving, now);
                Ok(())
            }
            ManagerMessage::ElectNo { election } => {
                self.on_elect_no(election);
                Ok(())
            }
            ManagerMessage::Update { .. } if self.role == ReplicaRole::Primary => {
                warn!(replica = %self.id, from = %peer, "primary ignoring state transfer");
                Ok(())
            }
            _ if self.role == ReplicaRole::Primary => {
                Err(ProtocolError::PrimaryReceivedReplication { replica: self.id, kind })
            }
            ManagerMessage::Update { snapshot } => self.apply_update(snapshot),
            ManagerMessage::ReadRequestReceived { req, page, directory } => {
                let record = RequestRecord { req, kind: RequestKind::Read, page };
                self.mirror_admitted(kind, record, &directory)
            }
            ManagerMessage::WriteRequestReceived { req, page, directory } => {
                let record = RequestRecord { req, kind: RequestKind::Write, page };
                self.mirror_admitted(kind, record, &directory)
            }
            ManagerMessage::ReadConfirmReceived { req, page, directory } => {
                let record = RequestRecord { req, kind: RequestKind::Read, page };
                self.mirror_completed(record, &directory)
            }
            ManagerMessage::WriteConfirmReceived { req, page, directory } => {
                let record = RequestRecord { req, kind: RequestKind::Write, page };
                self.mirror_completed(record, &directory)
            }
        }
    }

    fn apply_update(&mut self, snapshot: ReplicaSnapshot) -> Result<(), ProtocolError> {
        self.directory = Directory::restore(&snapshot.directory)?;
        self.sessions = snapshot.sessions;
        self.current = snapshot.current.map(|record| InFlight {
            record,
            step: Step::Mirrored,
        });
        self.synced = true;
        info!(
            replica = %self.id,
            pages = self.directory.len(),
            clients = self.sessions.client_count(),
            "state transfer applied"
        );
        Ok(())
    }

    fn mirror_admitted(
        &mut self,
        kind: MsgType,
        record: RequestRecord,
        directory: &DirectorySnapshot,
    ) -> Result<(), ProtocolError> {
        if self.synced {
            if let Some(current) = self.current_record().filter(|c| c.req != record.req) {
                return Err(ProtocolError::MirrorOverlap {
                    replica: self.id,
                    kind,
                    req: record.req,
                    current: current.req,
                });
            }
        }

        self.directory = Directory::restore(directory)?;
        self.current = Some(InFlight {
            record,
            step: Step::Mirrored,
        });
        debug!(replica = %self.id, req = %record.req, page = %record.page, kind = %kind, "mirrored admission");
        Ok(())
    }

    fn mirror_completed(
        &mut self,
        record: RequestRecord,
        directory: &DirectorySnapshot,
    ) -> Result<(), ProtocolError> {
        if self.synced && self.current_record().map(|c| c.req) != Some(record.req) {
            return Err(ProtocolError::UnknownConfirmation {
                replica: self.id,
                req: record.req,
            });
        }

        self.directory = Directory::restore(directory)?;
        self.sessions.record(record.req, record.kind);
        self.current = None;
        debug!(replica = %self.id, req = %record.req, page = %record.page, "mirrored completion");
        Ok(())
    }

    fn on_elect_trigger(&mut self, trigger: RequestId, now: Instant) {
        match self.role {
            ReplicaRole::Primary => {
                debug!(replica = %self.id, trigger = %trigger, "already primary, re-announcing");
                self.announce_victory();
            }
            ReplicaRole::Backup => {
                info!(replica = %self.id, trigger = %trigger, "election triggered by node");
                self.start_election(now, false);
            }
            ReplicaRole::Electing => {
                debug!(replica = %self.id, trigger = %trigger, "bid already open");
            }
        }
    }

    fn start_election(&mut self, now: Instant, reviving: bool) {
        if let Some(election) = self.election.begin(now, self.election_timeout) {
            self.role = ReplicaRole::Electing;
            info!(replica = %self.id, election = %election, reviving, "bidding for primary");
            self.replicate(ManagerMessage::ElectMe { election, reviving });
        }
    }

    fn on_elect_me(&mut self, bidder: ManagerId, election: ElectionId, reviving: bool, now: Instant) {
        if reviving && (self.role == ReplicaRole::Primary || self.synced) {
            info!(replica = %self.id, peer = %bidder, "sending state transfer to reviving peer");
            self.replicate(ManagerMessage::Update {
                snapshot: self.snapshot(),
            });
        }

        if rejects_bid(self.role, self.id, bidder) {
            debug!(replica = %self.id, election = %election, "refusing bid");
            self.replicate(ManagerMessage::ElectNo { election });
            // Refused by rank alone: nobody is primary, so take over.
            if self.role == ReplicaRole::Backup {
                info!(replica = %self.id, peer = %bidder, "outranking bidder, bidding for primary");
                self.start_election(now, false);
            }
        } else {
            debug!(replica = %self.id, election = %election, "yielding to bid");
        }
    }

    fn on_elect_no(&mut self, election: ElectionId) {
        if !self.election.matches(election) {
            debug!(replica = %self.id, election = %election, "refusal for an election no longer open");
            return;
        }
        self.election.close();
        self.role = ReplicaRole::Backup;
        info!(replica = %self.id, election = %election, "bid refused, staying backup");
    }

    /// Declare victory once an open bid has gone unanswered.
    pub fn tick(&mut self, now: Instant) -> Result<(), ProtocolError> {
        if self.role == ReplicaRole::Electing && self.election.expired(now) {
            self.election.close();
            return self.become_primary();
        }
        Ok(())
    }

    fn become_primary(&mut self) -> Result<(), ProtocolError> {
        self.role = ReplicaRole::Primary;
        info!(replica = %self.id, pages = self.directory.len(), "won election, now primary");
        self.announce_victory();

        if let Some(record) = self.current_record() {
            info!(replica = %self.id, req = %record.req, "resuming in-flight request");
            match record.kind {
                RequestKind::Read => self.resume_read(record),
                RequestKind::Write => self.begin_invalidation(),
            }
        }
        self.admit_next()
    }

    /// The reader is already in the copy set; ask the owner again.
    fn resume_read(&mut self, record: RequestRecord) {
        match self.directory.owner(record.page) {
            Some(owner) => {
                self.set_step(Step::AwaitReadConfirm);
                self.send_node(
                    owner,
                    Message::ReadForward {
                        req: record.req,
                        reader: record.requestor(),
                        page: record.page,
                    },
                );
            }
            None => {
                warn!(replica = %self.id, req = %record.req, page = %record.page, "mirrored read has no owner, dropping it");
                self.current = None;
            }
        }
    }

    fn announce_victory(&mut self) {
        let election = self.election.next_id();
        let reached = self.outbox.broadcast_nodes(&Message::ElectionWin {
            manager: self.id,
            election,
        });
        debug!(replica = %self.id, election = %election, reached, "announced primary");
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Commands that can be sent to a replica thread.
#[derive(Debug)]
pub enum ManagerCommand {
    GetState(Sender<ReplicaState>),
    Stop,
}

/// Handle to a running replica thread.
pub struct ManagerHandle {
    pub id: ManagerId,
    command_tx: Sender<ManagerCommand>,
    thread_handle: Option<JoinHandle<()>>,
    killed: Arc<AtomicBool>,
}

impl ManagerHandle {
    /// Current state, or `None` once the replica is dead.
    pub fn get_state(&self) -> Option<ReplicaState> {
        if self.is_killed() {
            return None;
        }
        let (resp_tx, resp_rx) = bounded(1);
        if self.command_tx.send(ManagerCommand::GetState(resp_tx)).is_ok() {
            resp_rx.recv_timeout(Duration::from_secs(1)).ok()
        } else {
            None
        }
    }

    pub fn stop(&mut self) {
        let _ = self.command_tx.send(ManagerCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    /// Crash the replica. The network must already drop its traffic.
    pub fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        self.stop();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

enum Event {
    Command(Option<ManagerCommand>),
    Control(Option<Frame>),
    Client(Option<Frame>),
    Idle,
}

struct ManagerRunner {
    replica: Replica,
    endpoint: ManagerEndpoint,
    command_rx: Receiver<ManagerCommand>,
    killed: Arc<AtomicBool>,
    tick_interval: Duration,
}

impl ManagerRunner {
    fn run(mut self) {
        let client_rx = self.endpoint.client_receiver().clone();
        let control_rx = self.endpoint.control_receiver().clone();
        let command_rx = self.command_rx.clone();

        loop {
            if self.killed.load(Ordering::SeqCst) {
                info!(replica = %self.replica.id(), "replica stopped");
                return;
            }
            self.drain_control();

            let wait = self
                .replica
                .next_wakeup(Instant::now())
                .map_or(self.tick_interval, |d| d.min(self.tick_interval));
            let event = select! {
                recv(command_rx) -> cmd => Event::Command(cmd.ok()),
                recv(control_rx) -> frame => Event::Control(frame.ok()),
                recv(client_rx) -> frame => Event::Client(frame.ok()),
                default(wait) => Event::Idle,
            };

            match event {
                Event::Command(Some(ManagerCommand::GetState(tx))) => {
                    let _ = tx.send(self.replica.state());
                }
                Event::Command(Some(ManagerCommand::Stop)) | Event::Command(None) => return,
                Event::Control(Some(frame)) => {
                    if let Some((from, msg)) = self.endpoint.decode_control(frame) {
                        self.dispatch_control(from, msg);
                    }
                }
                Event::Client(Some(frame)) => {
                    // Node traffic never overtakes control traffic already queued.
                    self.drain_control();
                    if let Some((from, msg)) = self.endpoint.decode_client(frame) {
                        self.dispatch_client(from, msg);
                    }
                }
                // Mailboxes were replaced: this incarnation is over.
                Event::Control(None) | Event::Client(None) => return,
                Event::Idle => {}
            }

            if !self.replica.is_halted() {
                if let Err(e) = self.replica.tick(Instant::now()) {
                    self.replica.halt(e);
                }
            }
        }
    }

    fn drain_control(&mut self) {
        while let Some((from, msg)) = self.endpoint.try_recv_control() {
            self.dispatch_control(from, msg);
        }
    }

    fn dispatch_control(&mut self, from: Address, msg: ManagerMessage) {
        if self.replica.is_halted() {
            return;
        }
        if let Err(e) = self.replica.handle_control_message(from, msg, Instant::now()) {
            self.replica.halt(e);
        }
    }

    fn dispatch_client(&mut self, from: Address, msg: Message) {
        if self.replica.is_halted() {
            return;
        }
        if let Err(e) = self.replica.handle_node_message(from, msg, Instant::now()) {
            self.replica.halt(e);
        }
    }
}

/// Spawn a replica on its own thread.
pub fn spawn_manager(
    replica: Replica,
    endpoint: ManagerEndpoint,
    tick_interval: Duration,
) -> ManagerHandle {
    let (command_tx, command_rx) = unbounded();
    let killed = Arc::new(AtomicBool::new(false));
    let id = replica.id();

    let runner = ManagerRunner {
        replica,
        endpoint,
        command_rx,
        killed: Arc::clone(&killed),
        tick_interval,
    };
    let thread_handle = thread::spawn(move || runner.run());

    ManagerHandle {
        id,
        command_tx,
        thread_handle: Some(thread_handle),
        killed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivy::network::{MockNetwork, NodeEndpoint};
    use std::collections::HashMap;

    const CM1: ManagerId = ManagerId(1);
    const CM2: ManagerId = ManagerId(2);
    const P0: PageId = PageId(0);

    struct Harness {
        replica: Replica,
        _endpoint: ManagerEndpoint,
        peer: ManagerEndpoint,
        nodes: HashMap<NodeId, NodeEndpoint>,
        now: Instant,
    }

    impl Harness {
        /// Replica under test is `id`; the other replica's mailbox is observed.
        fn new(id: ManagerId) -> Self {
            let node_ids = [NodeId(1), NodeId(2), NodeId(3)];
            let network = MockNetwork::new(&node_ids, &[CM1, CM2]);
            let other = if id == CM1 { CM2 } else { CM1 };
            let endpoint = network.manager_endpoint(id).unwrap();
            let peer = network.manager_endpoint(other).unwrap();
            let nodes = node_ids
                .iter()
                .map(|&n| (n, network.node_endpoint(n).unwrap()))
                .collect();
            let replica = Replica::new(id, other, Duration::from_millis(50), endpoint.outbox.clone());
            Harness {
                replica,
                _endpoint: endpoint,
                peer,
                nodes,
                now: Instant::now(),
            }
        }

        /// Harness whose replica is already primary with an empty inbox.
        fn primary() -> Self {
            let mut h = Harness::new(CM1);
            h.replica.start_election(h.now, false);
            h.replica.tick(h.now + Duration::from_millis(50)).unwrap();
            assert_eq!(h.replica.role(), ReplicaRole::Primary);
            h.drain_all();
            h
        }

        fn drain_all(&mut self) {
            while self.peer.try_recv_control().is_some() {}
            for ep in self.nodes.values() {
                while ep.try_recv().is_some() {}
            }
        }

        fn from_node(&mut self, node: u32, msg: Message) -> Result<(), ProtocolError> {
            self.replica
                .handle_node_message(Address::Node(NodeId(node)), msg, self.now)
        }

        fn from_peer(&mut self, msg: ManagerMessage) -> Result<(), ProtocolError> {
            let other = self.replica.peer;
            self.replica
                .handle_control_message(Address::Manager(other), msg, self.now)
        }

        fn node_inbox(&self, node: u32) -> Vec<Message> {
            let ep = &self.nodes[&NodeId(node)];
            std::iter::from_fn(|| ep.try_recv().map(|(_, m)| m)).collect()
        }

        fn peer_inbox(&self) -> Vec<ManagerMessage> {
            std::iter::from_fn(|| self.peer.try_recv_control().map(|(_, m)| m)).collect()
        }
    }

    fn req(node: u32, seq: u64) -> RequestId {
        RequestId { node: NodeId(node), seq }
    }

    /// Test: Read Flow
    ///
    /// 1. N1 owns P0
    /// 2. N2 asks for a read copy: backup learns first, then owner gets RF
    /// 3. N2 confirms: backup learns completion, then N2 gets RC_ACK
    #[test]
    fn test_read_flow() {
        let mut h = Harness::primary();
        h.replica.directory.transfer_ownership(P0, NodeId(1));

        h.from_node(2, Message::ReadRequest { req: req(2, 1), page: P0 }).unwrap();
        assert_eq!(h.replica.request_state(), RequestState::HandlingRead);

        let replicated = h.peer_inbox();
        assert_eq!(replicated.len(), 1);
        let ManagerMessage::ReadRequestReceived { directory, .. } = &replicated[0] else {
            panic!("expected CM_RQ_RECV, got {:?}", replicated[0]);
        };
        assert!(directory.copysets[&P0].contains(&NodeId(2)));

        assert_eq!(
            h.node_inbox(1),
            vec![Message::ReadForward { req: req(2, 1), reader: NodeId(2), page: P0 }]
        );

        h.from_node(2, Message::ReadConfirm { req: req(2, 1), page: P0 }).unwrap();
        assert_eq!(h.replica.request_state(), RequestState::Idle);
        assert_eq!(h.peer_inbox()[0].kind(), MsgType::CmRcRecv);
        assert_eq!(
            h.node_inbox(2),
            vec![Message::ReadConfirmAck { req: req(2, 1), page: P0 }]
        );
    }

    /// Test: Write Invalidates Copies
    ///
    /// 1. N1 owns P0, N2 and N3 hold read copies
    /// 2. N3 asks to write: IV goes to both copy holders, nobody is forwarded yet
    /// 3. Both confirm: owner N1 gets WF for writer N3
    /// 4. N3 confirms: N3 owns P0 with an empty copy set
    #[test]
    fn test_write_invalidates_copies() {
        let mut h = Harness::primary();
        h.replica.directory.transfer_ownership(P0, NodeId(1));
        h.replica.directory.add_reader(P0, NodeId(2)).unwrap();
        h.replica.directory.add_reader(P0, NodeId(3)).unwrap();

        h.from_node(3, Message::WriteRequest { req: req(3, 1), page: P0 }).unwrap();
        assert_eq!(h.peer_inbox()[0].kind(), MsgType::CmWqRecv);
        let invalidate = Message::Invalidate { req: req(3, 1), writer: NodeId(3), page: P0 };
        assert_eq!(h.node_inbox(2), vec![invalidate.clone()]);
        assert_eq!(h.node_inbox(3), vec![invalidate]);
        assert!(h.node_inbox(1).is_empty());

        h.from_node(2, Message::InvalidateConfirm { req: req(3, 1), page: P0 }).unwrap();
        assert!(h.node_inbox(1).is_empty());
        h.from_node(3, Message::InvalidateConfirm { req: req(3, 1), page: P0 }).unwrap();
        assert_eq!(
            h.node_inbox(1),
            vec![Message::WriteForward { req: req(3, 1), writer: NodeId(3), page: P0 }]
        );

        h.from_node(3, Message::WriteConfirm { req: req(3, 1), page: P0 }).unwrap();
        let record = h.replica.directory.get(P0).unwrap();
        assert_eq!(record.owner, Some(NodeId(3)));
        assert!(record.copy_set.is_empty());
        assert_eq!(
            h.node_inbox(3),
            vec![Message::WriteConfirmAck { req: req(3, 1), page: P0 }]
        );
    }

    #[test]
    fn test_first_write_gets_write_init() {
        let mut h = Harness::primary();

        h.from_node(1, Message::WriteRequest { req: req(1, 1), page: P0 }).unwrap();
        assert_eq!(h.node_inbox(1), vec![Message::WriteInit { req: req(1, 1), page: P0 }]);

        h.from_node(1, Message::WriteConfirm { req: req(1, 1), page: P0 }).unwrap();
        assert_eq!(h.replica.directory.owner(P0), Some(NodeId(1)));
    }

    /// Test: Requests Are Serialized
    ///
    /// 1. N2 reads P0 (owned by N1) and N3 writes P0 right behind it
    /// 2. The write is not started until the read completes
    #[test]
    fn test_requests_are_serialized() {
        let mut h = Harness::primary();
        h.replica.directory.transfer_ownership(P0, NodeId(1));

        h.from_node(2, Message::ReadRequest { req: req(2, 1), page: P0 }).unwrap();
        h.from_node(3, Message::WriteRequest { req: req(3, 1), page: P0 }).unwrap();
        assert_eq!(h.replica.state().queued, 1);
        assert!(h.node_inbox(2).is_empty());

        h.from_node(2, Message::ReadConfirm { req: req(2, 1), page: P0 }).unwrap();
        assert_eq!(h.replica.request_state(), RequestState::HandlingWrite);
        // N2 just joined the copy set, so the write must revoke it.
        let inbox = h.node_inbox(2);
        assert!(inbox.contains(&Message::Invalidate { req: req(3, 1), writer: NodeId(3), page: P0 }));
    }

    /// Test: Idempotent Retry
    ///
    /// 1. Complete a write from N1
    /// 2. N1 retransmits WC with the same id: re-acked, nothing replicated
    /// 3. N1 retransmits WQ with the same id: dropped
    #[test]
    fn test_retransmitted_confirm_is_reacknowledged() {
        let mut h = Harness::primary();
        h.from_node(1, Message::WriteRequest { req: req(1, 4), page: P0 }).unwrap();
        h.from_node(1, Message::WriteConfirm { req: req(1, 4), page: P0 }).unwrap();
        h.drain_all();

        h.from_node(1, Message::WriteConfirm { req: req(1, 4), page: P0 }).unwrap();
        assert_eq!(
            h.node_inbox(1),
            vec![Message::WriteConfirmAck { req: req(1, 4), page: P0 }]
        );
        assert!(h.peer_inbox().is_empty());

        h.from_node(1, Message::WriteRequest { req: req(1, 4), page: P0 }).unwrap();
        assert!(h.node_inbox(1).is_empty());
        assert_eq!(h.replica.request_state(), RequestState::Idle);

        // Older ids are stale and dropped silently.
        h.from_node(1, Message::WriteConfirm { req: req(1, 2), page: P0 }).unwrap();
        assert!(h.node_inbox(1).is_empty());
    }

    #[test]
    fn test_retransmitted_request_is_not_readmitted() {
        let mut h = Harness::primary();
        h.replica.directory.transfer_ownership(P0, NodeId(1));
        h.replica.directory.add_reader(P0, NodeId(2)).unwrap();

        h.from_node(3, Message::WriteRequest { req: req(3, 1), page: P0 }).unwrap();
        h.from_node(3, Message::WriteRequest { req: req(3, 1), page: P0 }).unwrap();

        assert_eq!(h.node_inbox(2).len(), 1);
        assert_eq!(h.replica.state().queued, 0);
    }

    #[test]
    fn test_read_of_unwritten_page() {
        let mut h = Harness::primary();

        h.from_node(2, Message::ReadRequest { req: req(2, 1), page: PageId(9) }).unwrap();
        assert_eq!(
            h.node_inbox(2),
            vec![Message::PageNotFound { req: req(2, 1), page: PageId(9) }]
        );
        assert!(h.replica.directory.is_empty());
        assert!(h.peer_inbox().is_empty());
        assert_eq!(h.replica.request_state(), RequestState::Idle);
    }

    #[test]
    fn test_confirmation_overrun_is_fatal() {
        let mut h = Harness::primary();
        h.replica.directory.transfer_ownership(P0, NodeId(1));
        h.replica.directory.add_reader(P0, NodeId(2)).unwrap();
        h.replica.directory.add_reader(P0, NodeId(3)).unwrap();
        h.from_node(3, Message::WriteRequest { req: req(3, 1), page: P0 }).unwrap();

        // Duplicates are harmless...
        h.from_node(2, Message::InvalidateConfirm { req: req(3, 1), page: P0 }).unwrap();
        h.from_node(2, Message::InvalidateConfirm { req: req(3, 1), page: P0 }).unwrap();
        assert!(h.node_inbox(1).is_empty());

        // ...but a node that was never asked is not.
        let err = h
            .from_node(1, Message::InvalidateConfirm { req: req(3, 1), page: P0 })
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::ConfirmationOverrun { req: req(3, 1), from: NodeId(1), page: P0 }
        );
    }

    #[test]
    fn test_owner_reading_own_page_is_fatal() {
        let mut h = Harness::primary();
        h.replica.directory.transfer_ownership(P0, NodeId(1));

        let err = h
            .from_node(1, Message::ReadRequest { req: req(1, 1), page: P0 })
            .unwrap_err();
        assert_eq!(err, ProtocolError::OwnerReadsOwnPage { owner: NodeId(1), page: P0 });
    }

    #[test]
    fn test_unknown_confirmation_is_fatal() {
        let mut h = Harness::primary();

        let err = h
            .from_node(2, Message::ReadConfirm { req: req(2, 5), page: P0 })
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownConfirmation { replica: CM1, req: req(2, 5) });
    }

    #[test]
    fn test_backup_drops_client_traffic() {
        let mut h = Harness::new(CM1);

        h.from_node(2, Message::WriteRequest { req: req(2, 1), page: P0 }).unwrap();
        assert!(h.node_inbox(2).is_empty());
        assert!(h.peer_inbox().is_empty());
        assert_eq!(h.replica.request_state(), RequestState::Idle);
    }

    /// Test: Takeover Resumes Mirrored Write
    ///
    /// 1. Backup mirrors CM_WQ_RECV for N3's write of P0 (owner N1, copy N2)
    /// 2. A node triggers an election; nobody refuses; backup becomes primary
    /// 3. It announces itself and re-sends the invalidation
    /// 4. N3's retried WC (it already had the page) completes the write
    #[test]
    fn test_takeover_resumes_mirrored_write() {
        let mut h = Harness::new(CM2);

        let mut directory = Directory::new();
        directory.transfer_ownership(P0, NodeId(1));
        directory.add_reader(P0, NodeId(2)).unwrap();
        h.from_peer(ManagerMessage::WriteRequestReceived {
            req: req(3, 1),
            page: P0,
            directory: directory.snapshot(),
        })
        .unwrap();
        assert_eq!(h.replica.request_state(), RequestState::HandlingWrite);

        h.from_node(1, Message::Elect { req: req(1, 9) }).unwrap();
        assert_eq!(h.replica.role(), ReplicaRole::Electing);
        assert_eq!(h.peer_inbox()[0].kind(), MsgType::CmElectMe);

        h.replica.tick(h.now + Duration::from_millis(50)).unwrap();
        assert_eq!(h.replica.role(), ReplicaRole::Primary);

        let inbox = h.node_inbox(2);
        assert!(matches!(inbox[0], Message::ElectionWin { manager: CM2, .. }));
        assert_eq!(inbox[1], Message::Invalidate { req: req(3, 1), writer: NodeId(3), page: P0 });

        h.from_node(3, Message::WriteConfirm { req: req(3, 1), page: P0 }).unwrap();
        assert_eq!(h.replica.directory.owner(P0), Some(NodeId(3)));
        assert!(h.node_inbox(3).contains(&Message::WriteConfirmAck { req: req(3, 1), page: P0 }));

        // The late confirm from N2 is ignored.
        h.from_node(2, Message::InvalidateConfirm { req: req(3, 1), page: P0 }).unwrap();
    }

    #[test]
    fn test_takeover_resumes_mirrored_read() {
        let mut h = Harness::new(CM2);

        let mut directory = Directory::new();
        directory.transfer_ownership(P0, NodeId(1));
        directory.add_reader(P0, NodeId(2)).unwrap();
        h.from_peer(ManagerMessage::ReadRequestReceived {
            req: req(2, 3),
            page: P0,
            directory: directory.snapshot(),
        })
        .unwrap();

        h.from_node(2, Message::Elect { req: req(2, 4) }).unwrap();
        h.replica.tick(h.now + Duration::from_millis(50)).unwrap();

        let inbox = h.node_inbox(1);
        assert_eq!(
            inbox.last(),
            Some(&Message::ReadForward { req: req(2, 3), reader: NodeId(2), page: P0 })
        );
    }

    #[test]
    fn test_backup_mirrors_completion() {
        let mut h = Harness::new(CM2);
        let mut directory = Directory::new();
        directory.ensure(P0);

        h.from_peer(ManagerMessage::WriteRequestReceived {
            req: req(1, 1),
            page: P0,
            directory: directory.snapshot(),
        })
        .unwrap();

        directory.transfer_ownership(P0, NodeId(1));
        h.from_peer(ManagerMessage::WriteConfirmReceived {
            req: req(1, 1),
            page: P0,
            directory: directory.snapshot(),
        })
        .unwrap();

        let state = h.replica.state();
        assert_eq!(state.request_state, RequestState::Idle);
        assert_eq!(state.directory.owners.get(&P0), Some(&NodeId(1)));
        assert_eq!(state.sessions.last_sequence(NodeId(1)), 1);

        // A completion it never saw admitted is a broken stream.
        let err = h
            .from_peer(ManagerMessage::ReadConfirmReceived {
                req: req(2, 1),
                page: P0,
                directory: directory.snapshot(),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownConfirmation { .. }));
    }

    #[test]
    fn test_primary_receiving_replication_is_fatal() {
        let mut h = Harness::primary();
        let err = h
            .from_peer(ManagerMessage::WriteRequestReceived {
                req: req(1, 1),
                page: P0,
                directory: DirectorySnapshot::default(),
            })
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::PrimaryReceivedReplication { replica: CM1, kind: MsgType::CmWqRecv }
        );
    }

    /// Test: Reviving Bid Gets State
    ///
    /// 1. Primary owns some directory state
    /// 2. Rebooted peer bids with `reviving`
    /// 3. Primary answers with CM_UPDATE, then CM_ELECT_NO
    #[test]
    fn test_reviving_bid_gets_update_then_refusal() {
        let mut h = Harness::primary();
        h.replica.directory.transfer_ownership(P0, NodeId(2));

        let election = ElectionId { manager: CM2, seq: 1 };
        h.from_peer(ManagerMessage::ElectMe { election, reviving: true }).unwrap();

        let replies = h.peer_inbox();
        assert_eq!(replies.len(), 2);
        let ManagerMessage::Update { snapshot } = &replies[0] else {
            panic!("expected CM_UPDATE first, got {:?}", replies[0]);
        };
        assert_eq!(snapshot.directory.owners.get(&P0), Some(&NodeId(2)));
        assert_eq!(replies[1], ManagerMessage::ElectNo { election });
    }

    #[test]
    fn test_lower_rank_backup_yields() {
        let mut h = Harness::new(CM2);
        let election = ElectionId { manager: CM1, seq: 1 };

        h.from_peer(ManagerMessage::ElectMe { election, reviving: false }).unwrap();
        assert!(h.peer_inbox().is_empty());
    }

    /// Test: Outranking Backup Takes Over
    ///
    /// 1. CM1 is a backup and CM2 bids
    /// 2. CM1 refuses and opens its own bid
    /// 3. With no refusal back, CM1 becomes primary and announces itself
    #[test]
    fn test_higher_rank_backup_refuses_and_takes_over() {
        let mut h = Harness::new(CM1);
        let election = ElectionId { manager: CM2, seq: 1 };

        h.from_peer(ManagerMessage::ElectMe { election, reviving: false }).unwrap();
        let replies = h.peer_inbox();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], ManagerMessage::ElectNo { election });
        assert!(matches!(replies[1], ManagerMessage::ElectMe { reviving: false, .. }));
        assert_eq!(h.replica.role(), ReplicaRole::Electing);

        h.replica.tick(h.now + Duration::from_millis(50)).unwrap();
        assert_eq!(h.replica.role(), ReplicaRole::Primary);
        assert!(matches!(h.node_inbox(1)[..], [Message::ElectionWin { manager: CM1, .. }]));
    }

    /// Test: Reviving Bid Refused By Backup
    ///
    /// A synced backup that outranks a rebooted peer sends it the state,
    /// refuses, and bids itself.
    #[test]
    fn test_reviving_bid_refused_by_backup() {
        let mut h = Harness::new(CM1);
        h.replica.directory.transfer_ownership(P0, NodeId(3));
        let election = ElectionId { manager: CM2, seq: 1 };

        h.from_peer(ManagerMessage::ElectMe { election, reviving: true }).unwrap();
        let replies = h.peer_inbox();
        assert_eq!(replies.len(), 3);
        assert!(matches!(replies[0], ManagerMessage::Update { .. }));
        assert_eq!(replies[1], ManagerMessage::ElectNo { election });
        assert!(matches!(replies[2], ManagerMessage::ElectMe { .. }));
    }

    #[test]
    fn test_electing_replica_refuses_without_new_bid() {
        let mut h = Harness::new(CM1);
        h.replica.start_election(h.now, false);
        h.drain_all();

        let election = ElectionId { manager: CM2, seq: 1 };
        h.from_peer(ManagerMessage::ElectMe { election, reviving: false }).unwrap();
        assert_eq!(h.peer_inbox(), vec![ManagerMessage::ElectNo { election }]);
        assert_eq!(h.replica.role(), ReplicaRole::Electing);
    }

    #[test]
    fn test_refused_bid_returns_to_backup() {
        let mut h = Harness::new(CM2);
        h.from_node(1, Message::Elect { req: req(1, 1) }).unwrap();
        let ManagerMessage::ElectMe { election, .. } = h.peer_inbox()[0].clone() else {
            panic!("expected bid");
        };

        // A refusal for some other ballot changes nothing.
        let stale = ElectionId { manager: CM2, seq: election.seq + 10 };
        h.from_peer(ManagerMessage::ElectNo { election: stale }).unwrap();
        assert_eq!(h.replica.role(), ReplicaRole::Electing);

        h.from_peer(ManagerMessage::ElectNo { election }).unwrap();
        assert_eq!(h.replica.role(), ReplicaRole::Backup);

        // The expired deadline no longer promotes it.
        h.replica.tick(h.now + Duration::from_secs(1)).unwrap();
        assert_eq!(h.replica.role(), ReplicaRole::Backup);
    }

    #[test]
    fn test_primary_reannounces_on_trigger() {
        let mut h = Harness::primary();
        h.from_node(3, Message::Elect { req: req(3, 1) }).unwrap();

        for node in 1..=3 {
            let inbox = h.node_inbox(node);
            assert!(matches!(inbox[..], [Message::ElectionWin { manager: CM1, .. }]));
        }
        assert!(h.peer_inbox().is_empty());
    }

    #[test]
    fn test_rebooted_replica_bids_immediately() {
        let network = MockNetwork::new(&[NodeId(1)], &[CM1, CM2]);
        let endpoint = network.manager_endpoint(CM1).unwrap();
        let peer = network.manager_endpoint(CM2).unwrap();

        let replica = Replica::rebooted(
            CM1,
            CM2,
            Duration::from_millis(50),
            endpoint.outbox.clone(),
            Instant::now(),
        );
        assert_eq!(replica.role(), ReplicaRole::Electing);
        assert!(!replica.state().synced);

        let (_, bid) = peer.try_recv_control().unwrap();
        assert!(matches!(bid, ManagerMessage::ElectMe { reviving: true, .. }));
    }
}
