//! Page directory: who owns each page and who holds read copies.
//!
//! # Invariants
//!
//! 1. **Owner outside copy set**: a page's owner never appears in its copy set.
//! 2. **No orphan copies**: a page without an owner has an empty copy set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::errors::ProtocolError;
use super::message::{NodeId, PageId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRecord {
    /// Node holding the authoritative copy. `None` until the first write
    /// completes.
    pub owner: Option<NodeId>,
    /// Nodes holding read-only copies.
    pub copy_set: BTreeSet<NodeId>,
}

/// The wire form of a directory (`srcOwners` / `srcCopysets`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub owners: BTreeMap<PageId, NodeId>,
    pub copysets: BTreeMap<PageId, BTreeSet<NodeId>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directory {
    records: BTreeMap<PageId, PageRecord>,
}

impl Directory {
    pub fn new() -> Self {
        Directory {
            records: BTreeMap::new(),
        }
    }

    pub fn get(&self, page: PageId) -> Option<&PageRecord> {
        self.records.get(&page)
    }

    pub fn owner(&self, page: PageId) -> Option<NodeId> {
        self.records.get(&page).and_then(|r| r.owner)
    }

    pub fn copy_set(&self, page: PageId) -> BTreeSet<NodeId> {
        self.records
            .get(&page)
            .map(|r| r.copy_set.clone())
            .unwrap_or_default()
    }

    /// Create an empty record for a page about to be written.
    pub fn ensure(&mut self, page: PageId) -> &mut PageRecord {
        self.records.entry(page).or_default()
    }

    /// Register `reader` as holding a read copy.
    pub fn add_reader(&mut self, page: PageId, reader: NodeId) -> Result<(), ProtocolError> {
        let record = self.ensure(page);
        if record.owner == Some(reader) {
            return Err(ProtocolError::OwnerInCopySet { owner: reader, page });
        }
        record.copy_set.insert(reader);
        Ok(())
    }

    /// Hand the page to `writer`. Every read copy is gone by now.
    pub fn transfer_ownership(&mut self, page: PageId, writer: NodeId) {
        let record = self.ensure(page);
        record.owner = Some(writer);
        record.copy_set.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn check_invariants(&self) -> Result<(), ProtocolError> {
        for (&page, record) in &self.records {
            match record.owner {
                Some(owner) if record.copy_set.contains(&owner) => {
                    return Err(ProtocolError::OwnerInCopySet { owner, page });
                }
                None if !record.copy_set.is_empty() => {
                    return Err(ProtocolError::OrphanCopies { page });
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        let mut snapshot = DirectorySnapshot::default();
        for (&page, record) in &self.records {
            if let Some(owner) = record.owner {
                snapshot.owners.insert(page, owner);
            }
            snapshot.copysets.insert(page, record.copy_set.clone());
        }
        snapshot
    }

    /// Rebuild a directory from a replicated snapshot.
    pub fn restore(snapshot: &DirectorySnapshot) -> Result<Self, ProtocolError> {
        let mut directory = Directory::new();
        for (&page, copies) in &snapshot.copysets {
            directory.ensure(page).copy_set = copies.clone();
        }
        for (&page, &owner) in &snapshot.owners {
            directory.ensure(page).owner = Some(owner);
        }
        directory.check_invariants()?;
        Ok(directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_write_creates_record() {
        let mut dir = Directory::new();
        assert_eq!(dir.owner(PageId(0)), None);
        assert!(dir.is_empty());

        dir.transfer_ownership(PageId(0), NodeId(3));
        assert_eq!(dir.owner(PageId(0)), Some(NodeId(3)));
        assert!(dir.copy_set(PageId(0)).is_empty());
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_owner_cannot_join_copy_set() {
        let mut dir = Directory::new();
        dir.transfer_ownership(PageId(1), NodeId(2));

        assert!(dir.add_reader(PageId(1), NodeId(4)).is_ok());
        assert_eq!(
            dir.add_reader(PageId(1), NodeId(2)),
            Err(ProtocolError::OwnerInCopySet { owner: NodeId(2), page: PageId(1) })
        );
        assert!(dir.check_invariants().is_ok());
    }

    #[test]
    fn test_write_clears_copy_set() {
        let mut dir = Directory::new();
        dir.transfer_ownership(PageId(0), NodeId(1));
        dir.add_reader(PageId(0), NodeId(2)).unwrap();
        dir.add_reader(PageId(0), NodeId(3)).unwrap();

        dir.transfer_ownership(PageId(0), NodeId(3));
        let record = dir.get(PageId(0)).unwrap();
        assert_eq!(record.owner, Some(NodeId(3)));
        assert!(record.copy_set.is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut dir = Directory::new();
        dir.transfer_ownership(PageId(0), NodeId(1));
        dir.add_reader(PageId(0), NodeId(2)).unwrap();
        // Record created by an admitted write that has not completed yet.
        dir.ensure(PageId(5));

        let restored = Directory::restore(&dir.snapshot()).unwrap();
        assert_eq!(restored, dir);
    }

    #[test]
    fn test_restore_rejects_owner_in_copy_set() {
        let mut snapshot = DirectorySnapshot::default();
        snapshot.owners.insert(PageId(0), NodeId(1));
        snapshot.copysets.insert(PageId(0), [NodeId(1)].into_iter().collect());

        assert!(matches!(
            Directory::restore(&snapshot),
            Err(ProtocolError::OwnerInCopySet { .. })
        ));
    }
}
