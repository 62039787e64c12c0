//! Client node: page cache plus the request/confirm protocol engine.
//!
//! Each node runs a listener thread that owns its mailbox. The listener serves
//! forwards and invalidations from the manager on its own, and hands replies
//! to an outstanding request over to the client thread through a completion
//! channel. Client calls on the same page are serialized by a per-page gate,
//! so a cache hit never waits on another page. Protocol exchanges are
//! serialized node-wide; the manager only ever sees one request per node at a
//! time.
//!
//! A request keeps its id across every retransmission. When a reply does not
//! arrive within the request timeout the node forgets its primary, triggers
//! an election, and resends once a winner has announced itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, trace, warn};

use super::config::IvyConfig;
use super::errors::{IvyError, ProtocolError};
use super::message::{Address, ManagerId, Message, NodeId, PageId, RequestId, RequestKind};
use super::network::{NodeEndpoint, Outbox, Received};

/// Access right a node holds on a cached page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Invalid,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub access: Access,
    /// Contents last seen. Survives invalidation so a stale owner can still
    /// answer a forward re-sent after a takeover.
    pub data: Option<String>,
}

/// Point-in-time view of a node, for checkers and tests.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub known_primary: Option<ManagerId>,
    pub pages: BTreeMap<PageId, CachedPage>,
}

impl NodeSnapshot {
    pub fn access(&self, page: PageId) -> Access {
        self.pages.get(&page).map_or(Access::Invalid, |p| p.access)
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    req: RequestId,
    page: PageId,
    kind: RequestKind,
}

/// A reply to the outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Completion {
    ReadPage(String),
    WritePage(String),
    WriteInit,
    NotFound,
    Ack,
}

struct NodeShared {
    id: NodeId,
    request_timeout: Duration,
    outbox: Outbox,
    cache: Mutex<HashMap<PageId, CachedPage>>,
    /// Held for the whole of one client operation on a page.
    page_gates: Mutex<HashMap<PageId, Arc<Mutex<()>>>>,
    /// Held for the whole of one protocol exchange.
    request_slot: Mutex<()>,
    pending: Mutex<Option<PendingRequest>>,
    completion_tx: Sender<(RequestId, Completion)>,
    completion_rx: Receiver<(RequestId, Completion)>,
    primary: Mutex<Option<ManagerId>>,
    primary_changed: Condvar,
    next_seq: AtomicU64,
    shutdown: AtomicBool,
    fatal: Mutex<Option<ProtocolError>>,
}

/// Handle to a running node.
pub struct NodeHandle {
    shared: Arc<NodeShared>,
    listener: Option<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn spawn(
        id: NodeId,
        endpoint: NodeEndpoint,
        config: &IvyConfig,
    ) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        let shared = Arc::new(NodeShared {
            id,
            request_timeout: config.request_timeout,
            outbox: endpoint.outbox.clone(),
            cache: Mutex::new(HashMap::new()),
            page_gates: Mutex::new(HashMap::new()),
            request_slot: Mutex::new(()),
            pending: Mutex::new(None),
            completion_tx,
            completion_rx,
            primary: Mutex::new(None),
            primary_changed: Condvar::new(),
            next_seq: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            fatal: Mutex::new(None),
        });

        let listener = {
            let shared = Arc::clone(&shared);
            let tick = config.tick_interval;
            thread::spawn(move || shared.listen(endpoint, tick))
        };

        NodeHandle {
            shared,
            listener: Some(listener),
        }
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    /// Read a page, fetching a read copy from its owner on a miss.
    pub fn client_read(&self, page: PageId) -> Result<String, IvyError> {
        let gate = self.shared.page_gate(page);
        let _page = gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.ensure_running()?;

        if let Some(data) = self.shared.cached(page, |a| a != Access::Invalid) {
            debug!(node = %self.shared.id, page = %page, "read hit");
            return Ok(data);
        }
        self.shared.read_protocol(page)
    }

    /// Write a page, acquiring ownership first unless this node already
    /// holds it writable.
    pub fn client_write(&self, page: PageId, data: impl Into<String>) -> Result<(), IvyError> {
        let data = data.into();
        let gate = self.shared.page_gate(page);
        let _page = gate.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.ensure_running()?;

        {
            let mut cache = self.shared.lock_cache();
            if let Some(entry) = cache.get_mut(&page).filter(|e| e.access == Access::ReadWrite) {
                debug!(node = %self.shared.id, page = %page, "write hit");
                entry.data = Some(data);
                return Ok(());
            }
        }
        self.shared.write_protocol(page, data)
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let pages = self
            .shared
            .lock_cache()
            .iter()
            .map(|(&page, entry)| (page, entry.clone()))
            .collect();
        NodeSnapshot {
            id: self.shared.id,
            known_primary: self.shared.known_primary(),
            pages,
        }
    }

    pub fn fatal_error(&self) -> Option<ProtocolError> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.primary_changed.notify_all();
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl NodeShared {
    fn lock_slot(&self) -> std::sync::MutexGuard<'_, ()> {
        self.request_slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn page_gate(&self, page: PageId) -> Arc<Mutex<()>> {
        let mut gates = self.page_gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(page).or_default())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<PageId, CachedPage>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached(&self, page: PageId, usable: impl Fn(Access) -> bool) -> Option<String> {
        self.lock_cache()
            .get(&page)
            .filter(|e| usable(e.access))
            .and_then(|e| e.data.clone())
    }

    fn store(&self, page: PageId, access: Access, data: String) {
        self.lock_cache().insert(
            page,
            CachedPage {
                access,
                data: Some(data),
            },
        );
    }

    fn ensure_running(&self) -> Result<(), IvyError> {
        if let Some(err) = self.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(IvyError::Halted(err));
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(IvyError::ShutDown);
        }
        Ok(())
    }

    fn known_primary(&self) -> Option<ManagerId> {
        *self.primary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop `suspect` as primary unless someone else was announced meanwhile.
    fn forget_primary(&self, suspect: ManagerId) {
        let mut primary = self.primary.lock().unwrap_or_else(PoisonError::into_inner);
        if *primary == Some(suspect) {
            *primary = None;
        }
    }

    fn next_request(&self) -> RequestId {
        RequestId {
            node: self.id,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        }
    }

    // ========================================================================
    // CLIENT SIDE
    // ========================================================================

    fn read_protocol(&self, page: PageId) -> Result<String, IvyError> {
        let _slot = self.lock_slot();
        self.ensure_running()?;
        let req = self.next_request();
        self.set_pending(Some(PendingRequest {
            req,
            page,
            kind: RequestKind::Read,
        }));
        let result = self.run_read(req, page);
        self.set_pending(None);
        result
    }

    fn run_read(&self, req: RequestId, page: PageId) -> Result<String, IvyError> {
        let reply = self.exchange(req, Message::ReadRequest { req, page }, |c| {
            matches!(c, Completion::ReadPage(_) | Completion::NotFound)
        })?;
        let data = match reply {
            Completion::ReadPage(data) => data,
            _ => {
                info!(node = %self.id, req = %req, page = %page, "page not found");
                return Err(IvyError::PageNotFound(page));
            }
        };

        self.store(page, Access::ReadOnly, data.clone());
        self.exchange(req, Message::ReadConfirm { req, page }, |c| *c == Completion::Ack)?;
        info!(node = %self.id, req = %req, page = %page, "read complete");
        Ok(data)
    }

    fn write_protocol(&self, page: PageId, data: String) -> Result<(), IvyError> {
        let _slot = self.lock_slot();
        self.ensure_running()?;
        let req = self.next_request();
        self.set_pending(Some(PendingRequest {
            req,
            page,
            kind: RequestKind::Write,
        }));
        let result = self.run_write(req, page, data);
        self.set_pending(None);
        result
    }

    fn run_write(&self, req: RequestId, page: PageId, data: String) -> Result<(), IvyError> {
        let reply = self.exchange(req, Message::WriteRequest { req, page }, |c| {
            matches!(c, Completion::WritePage(_) | Completion::WriteInit)
        })?;
        if reply == Completion::WriteInit {
            debug!(node = %self.id, req = %req, page = %page, "first write of page");
        }

        self.store(page, Access::ReadWrite, data);
        self.exchange(req, Message::WriteConfirm { req, page }, |c| *c == Completion::Ack)?;
        info!(node = %self.id, req = %req, page = %page, "write complete");
        Ok(())
    }

    fn set_pending(&self, pending: Option<PendingRequest>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = pending;
    }

    /// Send `msg` to the primary until a reply accepted by `expected` arrives.
    fn exchange(
        &self,
        req: RequestId,
        msg: Message,
        expected: impl Fn(&Completion) -> bool,
    ) -> Result<Completion, IvyError> {
        loop {
            let primary = self.primary_or_elect(req)?;
            debug!(node = %self.id, req = %req, to = %primary, kind = %msg.kind(), "sending");
            self.outbox.send(Address::Manager(primary), &msg);

            let deadline = Instant::now() + self.request_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.completion_rx.recv_timeout(remaining) {
                    Ok((id, completion)) if id == req && expected(&completion) => {
                        return Ok(completion);
                    }
                    Ok((id, completion)) => {
                        debug!(node = %self.id, req = %req, got = %id, ?completion, "ignoring reply");
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return Err(IvyError::ShutDown),
                }
                self.ensure_running()?;
            }

            self.ensure_running()?;
            warn!(node = %self.id, req = %req, primary = %primary, "request timed out, re-electing");
            self.forget_primary(primary);
        }
    }

    /// The known primary, or ask every replica to elect one and wait for the
    /// announcement.
    fn primary_or_elect(&self, trigger: RequestId) -> Result<ManagerId, IvyError> {
        loop {
            self.ensure_running()?;
            if let Some(primary) = self.known_primary() {
                return Ok(primary);
            }

            info!(node = %self.id, trigger = %trigger, "no known primary, triggering election");
            self.outbox.broadcast_managers(&Message::Elect { req: trigger });

            let guard = self.primary.lock().unwrap_or_else(PoisonError::into_inner);
            let (guard, _) = self
                .primary_changed
                .wait_timeout_while(guard, self.request_timeout, |p| {
                    p.is_none() && !self.shutdown.load(Ordering::SeqCst)
                })
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(primary) = *guard {
                return Ok(primary);
            }
        }
    }

    // ========================================================================
    // LISTENER
    // ========================================================================

    fn listen(&self, endpoint: NodeEndpoint, tick: Duration) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match endpoint.recv_timeout(tick) {
                Received::Message(from, msg) => {
                    trace!(node = %self.id, from = %from, kind = %msg.kind(), req = ?msg.request_id(), "recv");
                    if let Err(err) = self.handle_message(from, msg) {
                        error!(node = %self.id, error = %err, "protocol violation, halting node");
                        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                        self.primary_changed.notify_all();
                        return;
                    }
                }
                Received::Garbled | Received::Timeout => {}
                Received::Closed => return,
            }
        }
    }

    fn handle_message(&self, from: Address, msg: Message) -> Result<(), ProtocolError> {
        match msg {
            Message::ReadForward { req, reader, page } => self.serve_read(req, reader, page),
            Message::WriteForward { req, writer, page } => self.serve_write(req, writer, page),
            Message::Invalidate { req, writer, page } => {
                if writer != self.id {
                    if let Some(entry) = self.lock_cache().get_mut(&page) {
                        entry.access = Access::Invalid;
                    }
                    debug!(node = %self.id, req = %req, page = %page, "invalidated");
                }
                self.outbox
                    .send(from, &Message::InvalidateConfirm { req, page });
                Ok(())
            }
            Message::ReadPage { req, data, .. } => {
                self.complete(req, Completion::ReadPage(data));
                Ok(())
            }
            Message::WritePage { req, data, .. } => {
                self.complete(req, Completion::WritePage(data));
                Ok(())
            }
            Message::WriteInit { req, .. } => {
                self.complete(req, Completion::WriteInit);
                Ok(())
            }
            Message::PageNotFound { req, .. } => {
                self.complete(req, Completion::NotFound);
                Ok(())
            }
            Message::ReadConfirmAck { req, .. } | Message::WriteConfirmAck { req, .. } => {
                self.complete(req, Completion::Ack);
                Ok(())
            }
            Message::ElectionWin { manager, election } => {
                let mut primary = self.primary.lock().unwrap_or_else(PoisonError::into_inner);
                if *primary != Some(manager) {
                    info!(node = %self.id, primary = %manager, election = %election, "new primary");
                }
                *primary = Some(manager);
                self.primary_changed.notify_all();
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedMessage {
                at: Address::Node(self.id),
                kind: other.kind(),
            }),
        }
    }

    /// Owner side of a read: hand a copy to the reader and drop to read-only.
    fn serve_read(&self, req: RequestId, reader: NodeId, page: PageId) -> Result<(), ProtocolError> {
        let data = {
            let mut cache = self.lock_cache();
            let entry = cache
                .get_mut(&page)
                .filter(|e| e.data.is_some())
                .ok_or(ProtocolError::ForwardWithoutPage { node: self.id, page })?;
            if entry.access == Access::ReadWrite {
                entry.access = Access::ReadOnly;
            }
            entry.data.clone().unwrap_or_default()
        };
        debug!(node = %self.id, req = %req, page = %page, reader = %reader, "serving read copy");
        self.outbox
            .send(Address::Node(reader), &Message::ReadPage { req, page, data });
        Ok(())
    }

    /// Owner side of a write: hand the page over and give up access.
    fn serve_write(&self, req: RequestId, writer: NodeId, page: PageId) -> Result<(), ProtocolError> {
        let data = {
            let mut cache = self.lock_cache();
            let entry = cache
                .get_mut(&page)
                .filter(|e| e.data.is_some())
                .ok_or(ProtocolError::ForwardWithoutPage { node: self.id, page })?;
            if writer != self.id {
                entry.access = Access::Invalid;
            }
            entry.data.clone().unwrap_or_default()
        };

        if writer == self.id {
            // Upgrading our own read-only copy.
            self.complete(req, Completion::WritePage(data));
        } else {
            debug!(node = %self.id, req = %req, page = %page, writer = %writer, "handing page to writer");
            self.outbox
                .send(Address::Node(writer), &Message::WritePage { req, page, data });
        }
        Ok(())
    }

    fn complete(&self, req: RequestId, completion: Completion) {
        let pending = *self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending {
            Some(p) if p.req == req => {
                debug!(node = %self.id, req = %req, page = %p.page, kind = ?p.kind, ?completion, "reply");
                let _ = self.completion_tx.send((req, completion));
            }
            _ => debug!(node = %self.id, req = %req, "reply to a request no longer pending"),
        }
    }
}
