//! IVY distributed shared memory with a fault-tolerant central manager.
//!
//! Client nodes cache pages under a single-writer / multiple-reader scheme.
//! Two manager replicas (primary and backup) keep the page directory; the
//! primary mirrors every request to the backup before acting on it, so the
//! backup can take over mid-request.
//!
//! # Invariants
//!
//! 1. **Mutual Exclusion**: at most one node holds a page writable, and no
//!    node holds it readable at the same time.
//! 2. **Single Primary**: at most one live replica acts as primary.
//! 3. **Exactly Once**: a request retried across failover takes effect once.
//! 4. **Owner Not Reader**: a page's owner never appears in its copy set.

pub mod config;
pub mod directory;
pub mod election;
pub mod errors;
pub mod manager;
pub mod message;
pub mod network;
pub mod node;
pub mod session;
pub mod system;


pub use config::{IvyConfig, MANAGER_IDS};
pub use election::ReplicaRole;
pub use errors::{IvyError, ProtocolError};
pub use manager::{ReplicaState, RequestState};
pub use message::{Address, ManagerId, NodeId, PageId};
pub use node::{Access, NodeSnapshot};
pub use system::IvySystem;
