//! Error types.
//!
//! Two families:
//! - [`ProtocolError`]: a broken invariant. The actor that detects it halts.
//! - [`IvyError`]: what a caller of the client API can see.
//!
//! Stale and duplicate messages are not errors at all; they are logged and
//! dropped where they arrive.

use thiserror::Error;

use super::message::{Address, ManagerId, MsgType, NodeId, PageId, RequestId};

/// Invariant violations. Any of these means the protocol state is corrupt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{owner} requested a read copy of {page}, which it owns")]
    OwnerReadsOwnPage { owner: NodeId, page: PageId },

    #[error("owner {owner} of {page} appears in its own copy set")]
    OwnerInCopySet { owner: NodeId, page: PageId },

    #[error("{page} has read copies but no owner")]
    OrphanCopies { page: PageId },

    #[error("{from} confirmed invalidation of {page} for {req} but was never asked")]
    ConfirmationOverrun { req: RequestId, from: NodeId, page: PageId },

    #[error("{replica} is primary but received {kind}")]
    PrimaryReceivedReplication { replica: ManagerId, kind: MsgType },

    #[error("{replica} received a confirmation for {req}, which it never recorded as pending")]
    UnknownConfirmation { replica: ManagerId, req: RequestId },

    #[error("{replica} received {kind} for {req} while still mirroring {current}")]
    MirrorOverlap { replica: ManagerId, kind: MsgType, req: RequestId, current: RequestId },

    #[error("{node} was asked to forward {page} but holds no copy of it")]
    ForwardWithoutPage { node: NodeId, page: PageId },

    #[error("{at} cannot handle {kind}")]
    UnexpectedMessage { at: Address, kind: MsgType },
}

/// Errors surfaced to callers of the client API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IvyError {
    #[error("{0} has never been written")]
    PageNotFound(PageId),

    #[error("halted after protocol violation: {0}")]
    Halted(#[from] ProtocolError),

    #[error("shutting down")]
    ShutDown,

    #[error("no such node: {0}")]
    UnknownNode(NodeId),

    #[error("no such replica: {0}")]
    UnknownManager(ManagerId),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Codec failure on the simulated wire.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
}
