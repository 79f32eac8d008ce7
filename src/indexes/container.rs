//! Indexes container
//!
//! Persists the nodes of externally maintained skip-list indexes.
//!
//! ```text
//! indexes   index (16) | key (16) | ~version (4)  -> node
//! ```
//!
//! The node stored under the index's own uuid is the list head.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use super::node::SkipNode;
use crate::mvcc::{PurgeCounts, Version};
use crate::storage::{
    key, version_key_at, Container, Lookup, Scope, Store, StoreError, StoreOptions, StoreResult,
    Transaction,
};

const INDEXES: &str = "indexes";

fn node_key(index: &Uuid, key_uuid: &Uuid, version: Version) -> Vec<u8> {
    key(&[index.as_bytes(), key_uuid.as_bytes(), &version.to_key()])
}

fn seek_node(
    scope: &Scope<'_>,
    nodes: &Container,
    index: &Uuid,
    key_uuid: &Uuid,
    version: Version,
) -> StoreResult<Option<SkipNode>> {
    let prefix = key(&[index.as_bytes(), key_uuid.as_bytes()]);
    match scope.seek(nodes.table(), &node_key(index, key_uuid, version), &prefix)? {
        Some((k, v)) => {
            let node = SkipNode::decode(INDEXES, &k, &v)?;
            Ok((!node.is_removed()).then_some(node))
        }
        None => Ok(None),
    }
}

#[derive(Debug)]
pub struct IndexContainer {
    nodes: Container,
}

impl IndexContainer {
    pub fn open(
        store: Arc<Store>,
        txn: Option<&Transaction<'_>>,
        options: StoreOptions,
    ) -> StoreResult<Self> {
        Ok(Self {
            nodes: Container::open(store, INDEXES, txn, options)?,
        })
    }

    pub fn close(&self) {
        self.nodes.close();
    }

    pub fn save_key(
        &self,
        txn: Option<&Transaction<'_>>,
        index: &Uuid,
        version: Version,
        key_uuid: &Uuid,
        node: &SkipNode,
    ) -> StoreResult<()> {
        let value = node.encode()?;
        self.nodes.put(txn, &node_key(index, key_uuid, version), &value)
    }

    /// Writes the zero-level node: `key_uuid` leaves the index.
    pub fn remove_key(
        &self,
        txn: Option<&Transaction<'_>>,
        index: &Uuid,
        version: Version,
        key_uuid: &Uuid,
    ) -> StoreResult<()> {
        self.save_key(txn, index, version, key_uuid, &SkipNode::removed())
    }

    /// Node of `key_uuid` at `version`; `None` if absent or removed.
    pub fn load_key(
        &self,
        txn: Option<&Transaction<'_>>,
        index: &Uuid,
        version: Version,
        key_uuid: &Uuid,
    ) -> StoreResult<Option<SkipNode>> {
        self.nodes
            .read(txn, |scope| seek_node(scope, &self.nodes, index, key_uuid, version))
    }

    /// Reusable lookup handle pinned to `(index, version)`.
    pub fn node_iterator<'t>(
        &'t self,
        txn: Option<&'t Transaction<'t>>,
        index: Uuid,
        version: Version,
    ) -> StoreResult<NodeIterator<'t>> {
        Ok(NodeIterator {
            nodes: &self.nodes,
            lookup: self.nodes.lookup(txn)?,
            index,
            version,
        })
    }

    /// Keys of `index` at `version` in index order, following bottom-level
    /// links from the head node.
    pub fn walk(
        &self,
        txn: Option<&Transaction<'_>>,
        index: &Uuid,
        version: Version,
    ) -> StoreResult<Vec<Uuid>> {
        self.nodes.read(txn, |scope| {
            let Some(head) = seek_node(scope, &self.nodes, index, index, version)? else {
                return Ok(Vec::new());
            };
            let mut keys = Vec::new();
            let mut seen = HashSet::new();
            let mut current = head.next();
            while let Some(key_uuid) = current {
                if !seen.insert(key_uuid) {
                    return Err(StoreError::corrupt(
                        INDEXES,
                        &node_key(index, &key_uuid, version),
                        "cycle in index",
                    ));
                }
                let node = seek_node(scope, &self.nodes, index, &key_uuid, version)?
                    .ok_or_else(|| {
                        StoreError::corrupt(
                            INDEXES,
                            &node_key(index, &key_uuid, version),
                            "link to removed key",
                        )
                    })?;
                current = node.next();
                keys.push(key_uuid);
            }
            Ok(keys)
        })
    }

    pub fn purge_index(&self, txn: Option<&Transaction<'_>>, watermark: Version) -> StoreResult<PurgeCounts> {
        let (counts, _) = self.nodes.write(txn, |t| {
            self.nodes
                .purge_below(t, watermark, |k| Ok((32, version_key_at(INDEXES, k, 32)?)))
        })?;
        Ok(counts)
    }

    pub fn undo_index(&self, txn: Option<&Transaction<'_>>, version: Version) -> StoreResult<PurgeCounts> {
        self.nodes.write(txn, |t| {
            self.nodes
                .undo_version(t, version, |k| version_key_at(INDEXES, k, 32))
        })
    }
}

/// Repeated node lookups against one `(index, version)` pair under one
/// read scope.
pub struct NodeIterator<'t> {
    nodes: &'t Container,
    lookup: Lookup<'t>,
    index: Uuid,
    version: Version,
}

impl NodeIterator<'_> {
    pub fn load(&mut self, key_uuid: &Uuid) -> StoreResult<Option<SkipNode>> {
        let nodes = self.nodes;
        let (index, version) = (self.index, self.version);
        self.lookup
            .with_scope(|scope| seek_node(scope, nodes, &index, key_uuid, version))
    }

    pub fn reset(&mut self) -> StoreResult<()> {
        self.lookup.reset()
    }

    pub fn close(&mut self) {
        self.lookup.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexes::SkipLevel;

    fn open() -> IndexContainer {
        let store = Arc::new(Store::in_memory().unwrap());
        IndexContainer::open(store, None, StoreOptions::in_memory()).unwrap()
    }

    fn v(n: u32) -> Version {
        Version::new(n)
    }

    fn link(prev: Option<Uuid>, next: Option<Uuid>) -> SkipNode {
        SkipNode::new(vec![SkipLevel::new(prev, next, 1)])
    }

    #[test]
    fn test_walk_follows_bottom_level() {
        let indexes = open();
        let index = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        indexes.save_key(None, &index, v(1), &index, &link(None, Some(a))).unwrap();
        indexes.save_key(None, &index, v(1), &a, &link(None, Some(b))).unwrap();
        indexes.save_key(None, &index, v(1), &b, &link(Some(a), None)).unwrap();
        assert_eq!(indexes.walk(None, &index, v(1)).unwrap(), vec![a, b]);

        indexes.save_key(None, &index, v(2), &a, &link(None, None)).unwrap();
        indexes.remove_key(None, &index, v(2), &b).unwrap();
        assert_eq!(indexes.walk(None, &index, v(2)).unwrap(), vec![a]);
        assert_eq!(indexes.walk(None, &index, v(1)).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_tombstone_law() {
        let indexes = open();
        let index = Uuid::new_v4();
        let a = Uuid::new_v4();
        indexes.save_key(None, &index, v(1), &a, &link(None, None)).unwrap();
        indexes.remove_key(None, &index, v(3), &a).unwrap();
        assert!(indexes.load_key(None, &index, v(2), &a).unwrap().is_some());
        assert!(indexes.load_key(None, &index, v(3), &a).unwrap().is_none());

        let mut it = indexes.node_iterator(None, index, v(2)).unwrap();
        assert!(it.load(&a).unwrap().is_some());
        it.reset().unwrap();
        it.close();
    }

    #[test]
    fn test_purge_and_undo() {
        let indexes = open();
        let index = Uuid::new_v4();
        let a = Uuid::new_v4();
        for n in 1..=3 {
            indexes.save_key(None, &index, v(n), &a, &link(None, None)).unwrap();
        }
        assert_eq!(indexes.purge_index(None, v(3)).unwrap().removed, 1);
        assert!(indexes.load_key(None, &index, v(2), &a).unwrap().is_some());
        assert_eq!(indexes.undo_index(None, v(3)).unwrap().removed, 1);
        assert!(indexes.load_key(None, &index, v(9), &a).unwrap().is_some());
    }
}
