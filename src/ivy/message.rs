//! Wire messages for the coherence protocol.
//!
//! Node traffic ([`Message`]) and replica-to-replica traffic
//! ([`ManagerMessage`]) travel on separate mailboxes. Both are bincode-encoded
//! before they enter a channel, so every hop goes through the same codec a
//! real transport would.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::directory::DirectorySnapshot;
use super::errors::WireError;
use super::session::SessionMap;

/// A client node. Nodes are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// A central manager replica. Lower ids outrank higher ones in elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagerId(pub u32);

/// A shared page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CM{}", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Anything that can send or receive a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Address {
    Node(NodeId),
    Manager(ManagerId),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Node(id) => id.fmt(f),
            Address::Manager(id) => id.fmt(f),
        }
    }
}

/// Identifies one client request across retries and failover.
///
/// The issuing node reuses the same id for every retransmission, which is
/// what lets a replica recognise a retry after it has already done the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    /// Node that issued the request.
    pub node: NodeId,
    /// Per-node monotonic counter.
    pub seq: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MSG_N{}_{}", self.node.0, self.seq)
    }
}

/// Identifies one election bid (or victory announcement) of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElectionId {
    pub manager: ManagerId,
    pub seq: u64,
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EL_CM{}_{}", self.manager.0, self.seq)
    }
}

/// Whether a request wants to read or write its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Read,
    Write,
}

/// A request as a replica tracks it: id, direction and page. The requestor is
/// `req.node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub req: RequestId,
    pub kind: RequestKind,
    pub page: PageId,
}

impl RequestRecord {
    pub fn requestor(&self) -> NodeId {
        self.req.node
    }
}

/// Message type tags as they appear in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Rq,
    Rf,
    Rc,
    RcAck,
    Rp,
    Wq,
    Wf,
    Wc,
    WcAck,
    Wi,
    Wp,
    Iv,
    Ic,
    El,
    ElWin,
    Pnf,
    CmUpdate,
    CmRqRecv,
    CmRcRecv,
    CmWqRecv,
    CmWcRecv,
    CmElectMe,
    CmElectNo,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Rq => "RQ",
            MsgType::Rf => "RF",
            MsgType::Rc => "RC",
            MsgType::RcAck => "RC_ACK",
            MsgType::Rp => "RP",
            MsgType::Wq => "WQ",
            MsgType::Wf => "WF",
            MsgType::Wc => "WC",
            MsgType::WcAck => "WC_ACK",
            MsgType::Wi => "WI",
            MsgType::Wp => "WP",
            MsgType::Iv => "IV",
            MsgType::Ic => "IC",
            MsgType::El => "EL",
            MsgType::ElWin => "ELWIN",
            MsgType::Pnf => "PNF",
            MsgType::CmUpdate => "CM_UPDATE",
            MsgType::CmRqRecv => "CM_RQ_RECV",
            MsgType::CmRcRecv => "CM_RC_RECV",
            MsgType::CmWqRecv => "CM_WQ_RECV",
            MsgType::CmWcRecv => "CM_WC_RECV",
            MsgType::CmElectMe => "CM_ELECT_ME",
            MsgType::CmElectNo => "CM_ELECT_NO",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic between nodes and replicas, and between nodes.
///
/// The sender is carried by the transport, not the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// RQ: node asks the primary for a read copy.
    ReadRequest { req: RequestId, page: PageId },
    /// RF: primary asks the owner to send its page to `reader`.
    ReadForward { req: RequestId, reader: NodeId, page: PageId },
    /// RP: owner delivers page contents to the reader.
    ReadPage { req: RequestId, page: PageId, data: String },
    /// RC: reader confirms it stored the page.
    ReadConfirm { req: RequestId, page: PageId },
    /// RC_ACK: primary closes the read.
    ReadConfirmAck { req: RequestId, page: PageId },
    /// WQ: node asks the primary for ownership.
    WriteRequest { req: RequestId, page: PageId },
    /// WF: primary asks the owner to hand its page to `writer`.
    WriteForward { req: RequestId, writer: NodeId, page: PageId },
    /// WP: owner delivers page contents to the writer.
    WritePage { req: RequestId, page: PageId, data: String },
    /// WI: primary tells the writer the page does not exist yet.
    WriteInit { req: RequestId, page: PageId },
    /// WC: writer confirms it took ownership.
    WriteConfirm { req: RequestId, page: PageId },
    /// WC_ACK: primary closes the write.
    WriteConfirmAck { req: RequestId, page: PageId },
    /// IV: primary revokes a read copy on behalf of `writer`.
    Invalidate { req: RequestId, writer: NodeId, page: PageId },
    /// IC: copy holder confirms the revocation.
    InvalidateConfirm { req: RequestId, page: PageId },
    /// PNF: primary refuses a read of a page that was never written.
    PageNotFound { req: RequestId, page: PageId },
    /// EL: node lost track of the primary and asks the replicas to elect one.
    Elect { req: RequestId },
    /// ELWIN: a replica announces that it is primary.
    ElectionWin { manager: ManagerId, election: ElectionId },
}

impl Message {
    pub fn kind(&self) -> MsgType {
        match self {
            Message::ReadRequest { .. } => MsgType::Rq,
            Message::ReadForward { .. } => MsgType::Rf,
            Message::ReadPage { .. } => MsgType::Rp,
            Message::ReadConfirm { .. } => MsgType::Rc,
            Message::ReadConfirmAck { .. } => MsgType::RcAck,
            Message::WriteRequest { .. } => MsgType::Wq,
            Message::WriteForward { .. } => MsgType::Wf,
            Message::WritePage { .. } => MsgType::Wp,
            Message::WriteInit { .. } => MsgType::Wi,
            Message::WriteConfirm { .. } => MsgType::Wc,
            Message::WriteConfirmAck { .. } => MsgType::WcAck,
            Message::Invalidate { .. } => MsgType::Iv,
            Message::InvalidateConfirm { .. } => MsgType::Ic,
            Message::PageNotFound { .. } => MsgType::Pnf,
            Message::Elect { .. } => MsgType::El,
            Message::ElectionWin { .. } => MsgType::ElWin,
        }
    }

    /// The client request this message belongs to, if any.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Message::ReadRequest { req, .. }
            | Message::ReadForward { req, .. }
            | Message::ReadPage { req, .. }
            | Message::ReadConfirm { req, .. }
            | Message::ReadConfirmAck { req, .. }
            | Message::WriteRequest { req, .. }
            | Message::WriteForward { req, .. }
            | Message::WritePage { req, .. }
            | Message::WriteInit { req, .. }
            | Message::WriteConfirm { req, .. }
            | Message::WriteConfirmAck { req, .. }
            | Message::Invalidate { req, .. }
            | Message::InvalidateConfirm { req, .. }
            | Message::PageNotFound { req, .. }
            | Message::Elect { req } => Some(*req),
            Message::ElectionWin { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Everything a replica needs to take over: the directory, the completed
/// request table, and the request in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub directory: DirectorySnapshot,
    pub sessions: SessionMap,
    pub current: Option<RequestRecord>,
}

/// Replica-to-replica traffic: replication stream and election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerMessage {
    /// CM_UPDATE: full state transfer to a reviving replica.
    Update { snapshot: ReplicaSnapshot },
    /// CM_RQ_RECV: primary admitted a read; reader is already in the copy set.
    ReadRequestReceived { req: RequestId, page: PageId, directory: DirectorySnapshot },
    /// CM_RC_RECV: read completed.
    ReadConfirmReceived { req: RequestId, page: PageId, directory: DirectorySnapshot },
    /// CM_WQ_RECV: primary admitted a write.
    WriteRequestReceived { req: RequestId, page: PageId, directory: DirectorySnapshot },
    /// CM_WC_RECV: write completed; writer is the new owner.
    WriteConfirmReceived { req: RequestId, page: PageId, directory: DirectorySnapshot },
    /// CM_ELECT_ME: bid for primary. `reviving` is set by a freshly rebooted
    /// replica that holds no state yet.
    ElectMe { election: ElectionId, reviving: bool },
    /// CM_ELECT_NO: refuse the bid with this id.
    ElectNo { election: ElectionId },
}

impl ManagerMessage {
    pub fn kind(&self) -> MsgType {
        match self {
            ManagerMessage::Update { .. } => MsgType::CmUpdate,
            ManagerMessage::ReadRequestReceived { .. } => MsgType::CmRqRecv,
            ManagerMessage::ReadConfirmReceived { .. } => MsgType::CmRcRecv,
            ManagerMessage::WriteRequestReceived { .. } => MsgType::CmWqRecv,
            ManagerMessage::WriteConfirmReceived { .. } => MsgType::CmWcRecv,
            ManagerMessage::ElectMe { .. } => MsgType::CmElectMe,
            ManagerMessage::ElectNo { .. } => MsgType::CmElectNo,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
