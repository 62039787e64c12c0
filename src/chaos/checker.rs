//! History and Coherence Checker.
//!
//! Records client operations with their real-time intervals and verifies:
//! - Read-After-Write: a read returns a value that was current at some point
//!   during the read (never a value overwritten before the read began)
//! - Single Primary: at most one live replica acts as primary
//! - Mutual Exclusion: a writable copy never coexists with another copy
//! - Directory Agreement: at rest, caches match the primary's directory

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::warn;

use crate::ivy::{
    Access, Address, IvyError, NodeId, NodeSnapshot, PageId, ProtocolError, ReplicaRole,
    ReplicaState, RequestState,
};

/// Types of operations that can be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Read { node: NodeId, page: PageId },
    Write { node: NodeId, page: PageId, value: String },
}

impl Operation {
    pub fn page(&self) -> PageId {
        match self {
            Operation::Read { page, .. } | Operation::Write { page, .. } => *page,
        }
    }
}

/// Result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Write done, or read returned this value.
    Success { value: Option<String> },
    /// Read of a page nobody had written.
    NotFound,
    Failure { reason: String },
}

impl From<&Result<String, IvyError>> for OperationResult {
    fn from(result: &Result<String, IvyError>) -> Self {
        match result {
            Ok(value) => OperationResult::Success {
                value: Some(value.clone()),
            },
            Err(IvyError::PageNotFound(_)) => OperationResult::NotFound,
            Err(e) => OperationResult::Failure {
                reason: e.to_string(),
            },
        }
    }
}

/// A single entry in the operation history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// When the operation was invoked.
    pub start: Instant,
    /// When it returned.
    pub end: Instant,
    pub operation: Operation,
    pub result: OperationResult,
}

impl HistoryEntry {
    fn succeeded(&self) -> bool {
        matches!(self.result, OperationResult::Success { .. })
    }
}

#[derive(Debug, Default, Clone)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        History {
            entries: Vec::new(),
        }
    }

    /// Record an operation that was invoked at `start` and has just returned.
    pub fn record(&mut self, start: Instant, operation: Operation, result: OperationResult) {
        self.entries.push(HistoryEntry {
            start,
            end: Instant::now(),
            operation,
            result,
        });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Thread-safe history wrapper.
#[derive(Clone, Default)]
pub struct SharedHistory {
    inner: Arc<Mutex<History>>,
}

impl SharedHistory {
    pub fn new() -> Self {
        SharedHistory::default()
    }

    pub fn record(&self, start: Instant, operation: Operation, result: OperationResult) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(start, operation, result);
    }

    /// Get a clone of the inner history for analysis.
    pub fn snapshot(&self) -> History {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Types of coherence violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// A read returned a value that was already overwritten, or never written.
    StaleRead,
    /// More than one live replica claims to be primary.
    MultiplePrimaries,
    /// A writable copy coexists with another copy of the same page.
    MultipleWriters,
    /// A node's access right disagrees with the primary's directory.
    OwnerMismatch,
    /// An actor halted on a protocol violation.
    ProtocolHalt,
}

#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
    /// Related history entries (by index).
    pub related_entries: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckStats {
    pub total_operations: usize,
    pub reads: usize,
    pub writes: usize,
    pub failed_operations: usize,
    pub pages: usize,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub stats: CheckStats,
}

/// The coherence checker (oracle).
#[derive(Debug, Default)]
pub struct Checker;

impl Checker {
    pub fn new() -> Self {
        Checker
    }

    /// Verify that every successful read saw a value that had not been
    /// superseded before the read was invoked.
    ///
    /// Write values must be unique across the history.
    pub fn check_history(&self, history: &History) -> CheckResult {
        let entries = history.entries();
        let mut violations = Vec::new();
        let mut stats = CheckStats::default();

        // Successful writes per page.
        let mut writes: BTreeMap<PageId, Vec<usize>> = BTreeMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            stats.total_operations += 1;
            if let OperationResult::Failure { reason } = &entry.result {
                warn!(op = ?entry.operation, reason = %reason, "operation failed");
                stats.failed_operations += 1;
            }
            match &entry.operation {
                Operation::Write { page, .. } => {
                    stats.writes += 1;
                    if entry.succeeded() {
                        writes.entry(*page).or_default().push(idx);
                    }
                }
                Operation::Read { .. } => stats.reads += 1,
            }
        }
        stats.pages = writes.len();

        for (idx, entry) in entries.iter().enumerate() {
            let Operation::Read { node, page } = &entry.operation else {
                continue;
            };
            let page_writes = writes.get(page).map(Vec::as_slice).unwrap_or(&[]);
            // A write that completed before this read started, followed by
            // another that also completed before it started, is superseded.
            let superseded = |w: usize| {
                page_writes.iter().any(|&later| {
                    entries[w].end < entries[later].start && entries[later].end < entry.start
                })
            };

            match &entry.result {
                OperationResult::Success { value: Some(value) } => {
                    let source = page_writes.iter().copied().find(|&w| {
                        matches!(&entries[w].operation, Operation::Write { value: v, .. } if v == value)
                    });
                    match source {
                        None => violations.push(Violation {
                            kind: ViolationKind::StaleRead,
                            description: format!("{} read {:?} from {}, which was never written", node, value, page),
                            related_entries: vec![idx],
                        }),
                        Some(w) if entries[w].start > entry.end => violations.push(Violation {
                            kind: ViolationKind::StaleRead,
                            description: format!("{} read {:?} from {} before it was written", node, value, page),
                            related_entries: vec![w, idx],
                        }),
                        Some(w) if superseded(w) => violations.push(Violation {
                            kind: ViolationKind::StaleRead,
                            description: format!("{} read overwritten value {:?} from {}", node, value, page),
                            related_entries: vec![w, idx],
                        }),
                        Some(_) => {}
                    }
                }
                OperationResult::NotFound => {
                    if let Some(&w) = page_writes.iter().find(|&&w| entries[w].end < entry.start) {
                        violations.push(Violation {
                            kind: ViolationKind::StaleRead,
                            description: format!("{} found no {} after it was written", node, page),
                            related_entries: vec![w, idx],
                        });
                    }
                }
                _ => {}
            }
        }

        CheckResult {
            passed: violations.is_empty(),
            violations,
            stats,
        }
    }

    /// Check the live cluster state. Directory agreement is only checked when
    /// the primary has nothing in flight.
    pub fn check_cluster(&self, managers: &[ReplicaState], nodes: &[NodeSnapshot]) -> Vec<Violation> {
        let mut violations = Vec::new();

        let primaries: Vec<&ReplicaState> = managers
            .iter()
            .filter(|s| s.role == ReplicaRole::Primary)
            .collect();
        if primaries.len() > 1 {
            violations.push(Violation {
                kind: ViolationKind::MultiplePrimaries,
                description: format!(
                    "primaries: {:?}",
                    primaries.iter().map(|s| s.id).collect::<Vec<_>>()
                ),
                related_entries: vec![],
            });
        }

        let mut holders: BTreeMap<PageId, (BTreeSet<NodeId>, BTreeSet<NodeId>)> = BTreeMap::new();
        for node in nodes {
            for (&page, cached) in &node.pages {
                let (writers, readers) = holders.entry(page).or_default();
                match cached.access {
                    Access::ReadWrite => {
                        writers.insert(node.id);
                    }
                    Access::ReadOnly => {
                        readers.insert(node.id);
                    }
                    Access::Invalid => {}
                }
            }
        }

        for (page, (writers, readers)) in &holders {
            if writers.len() > 1 || (!writers.is_empty() && !readers.is_empty()) {
                violations.push(Violation {
                    kind: ViolationKind::MultipleWriters,
                    description: format!("{}: writable at {:?}, readable at {:?}", page, writers, readers),
                    related_entries: vec![],
                });
            }
        }

        let Some(primary) = primaries
            .first()
            .filter(|p| p.request_state == RequestState::Idle && p.queued == 0)
        else {
            return violations;
        };
        for (page, (writers, readers)) in &holders {
            let owner = primary.directory.owners.get(page).copied();
            let copies = primary.directory.copysets.get(page).cloned().unwrap_or_default();
            for writer in writers {
                if Some(*writer) != owner {
                    violations.push(Violation {
                        kind: ViolationKind::OwnerMismatch,
                        description: format!("{} writes {} but the owner is {:?}", writer, page, owner),
                        related_entries: vec![],
                    });
                }
            }
            for reader in readers {
                if Some(*reader) != owner && !copies.contains(reader) {
                    violations.push(Violation {
                        kind: ViolationKind::OwnerMismatch,
                        description: format!("{} reads {} but is not in its copy set", reader, page),
                        related_entries: vec![],
                    });
                }
            }
        }
        violations
    }

    /// Turn halted actors into violations.
    pub fn check_halts(&self, fatal: &[(Address, ProtocolError)]) -> Vec<Violation> {
        fatal
            .iter()
            .map(|(at, err)| Violation {
                kind: ViolationKind::ProtocolHalt,
                description: format!("{} halted: {}", at, err),
                related_entries: vec![],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write(page: u64, value: &str) -> Operation {
        Operation::Write {
            node: NodeId(1),
            page: PageId(page),
            value: value.to_string(),
        }
    }

    fn read(page: u64) -> Operation {
        Operation::Read {
            node: NodeId(2),
            page: PageId(page),
        }
    }

    fn ok(value: Option<&str>) -> OperationResult {
        OperationResult::Success {
            value: value.map(str::to_string),
        }
    }

    /// Entries with explicit, non-overlapping intervals in the given order.
    fn sequential(ops: Vec<(Operation, OperationResult)>) -> History {
        let base = Instant::now();
        let mut history = History::new();
        for (i, (operation, result)) in ops.into_iter().enumerate() {
            let start = base + Duration::from_millis(10 * i as u64);
            history.entries.push(HistoryEntry {
                start,
                end: start + Duration::from_millis(5),
                operation,
                result,
            });
        }
        history
    }

    #[test]
    fn test_history_recording() {
        let shared = SharedHistory::new();
        shared.record(Instant::now(), write(0, "a"), ok(None));
        assert_eq!(shared.len(), 1);

        let history = shared.snapshot();
        assert_eq!(history.entries()[0].operation.page(), PageId(0));
        assert!(history.entries()[0].start <= history.entries()[0].end);
    }

    #[test]
    fn test_checker_accepts_fresh_reads() {
        let history = sequential(vec![
            (read(0), OperationResult::NotFound),
            (write(0, "a"), ok(None)),
            (read(0), ok(Some("a"))),
            (write(0, "b"), ok(None)),
            (read(0), ok(Some("b"))),
        ]);

        let result = Checker::new().check_history(&history);
        assert!(result.passed, "Violations: {:?}", result.violations);
        assert_eq!(result.stats.reads, 3);
        assert_eq!(result.stats.writes, 2);
    }

    #[test]
    fn test_checker_detects_stale_read() {
        let history = sequential(vec![
            (write(0, "a"), ok(None)),
            (write(0, "b"), ok(None)),
            (read(0), ok(Some("a"))),
        ]);

        let result = Checker::new().check_history(&history);
        assert!(!result.passed);
        assert_eq!(result.violations[0].kind, ViolationKind::StaleRead);
        assert_eq!(result.violations[0].related_entries, vec![0, 2]);
    }

    #[test]
    fn test_checker_detects_lost_page() {
        let history = sequential(vec![
            (write(3, "a"), ok(None)),
            (read(3), OperationResult::NotFound),
        ]);

        let result = Checker::new().check_history(&history);
        assert!(!result.passed);
        assert_eq!(result.violations[0].kind, ViolationKind::StaleRead);
    }

    #[test]
    fn test_concurrent_write_may_be_seen_either_way() {
        let base = Instant::now();
        let mut history = History::new();
        let at = |ms: u64| base + Duration::from_millis(ms);
        history.entries.push(HistoryEntry { start: at(0), end: at(5), operation: write(0, "a"), result: ok(None) });
        history.entries.push(HistoryEntry { start: at(10), end: at(30), operation: write(0, "b"), result: ok(None) });
        history.entries.push(HistoryEntry { start: at(15), end: at(20), operation: read(0), result: ok(Some("a")) });
        history.entries.push(HistoryEntry { start: at(16), end: at(25), operation: read(0), result: ok(Some("b")) });

        let result = Checker::new().check_history(&history);
        assert!(result.passed, "Violations: {:?}", result.violations);
    }
}
