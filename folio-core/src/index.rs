//! Document-wide block lookup shared by every [`BlockModel`].
//!
//! Nodes hold only a `Weak` to the index, never to each other, so the tree
//! has no reference cycles. Membership changes bump a generation counter
//! that the children projections use as part of their dependency stamp.
//!
//! A child → parent map is kept in step with each block's child list, so
//! parent lookups cost one hash probe instead of a scan over the index.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::block::{BlockId, BlockModel};
use crate::locks::{lock, read, write};

/// Work recorded by `yrs` observers and drained after the commit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingEvent {
    Added(BlockId),
    Removed(BlockId),
    PropsUpdated { block: BlockId, key: String },
    ChildrenUpdated { block: BlockId },
}

#[derive(Default)]
pub(crate) struct BlockIndex {
    blocks: RwLock<FxHashMap<BlockId, Arc<BlockModel>>>,
    parents: RwLock<FxHashMap<BlockId, BlockId>>,
    generation: AtomicU64,
    pending: Mutex<VecDeque<PendingEvent>>,
}

impl BlockIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<BlockModel>> {
        read(&self.blocks).get(id).cloned()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        read(&self.blocks).contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        read(&self.blocks).len()
    }

    pub(crate) fn all(&self) -> Vec<Arc<BlockModel>> {
        read(&self.blocks).values().cloned().collect()
    }

    /// Returns the block previously stored under the same id.
    pub(crate) fn insert(&self, block: Arc<BlockModel>) -> Option<Arc<BlockModel>> {
        let replaced = write(&self.blocks).insert(block.id().clone(), block);
        self.generation.fetch_add(1, Ordering::AcqRel);
        replaced
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<BlockModel>> {
        let removed = write(&self.blocks).remove(id);
        if removed.is_some() {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    /// Drop every block, returning them for teardown.
    pub(crate) fn clear(&self) -> Vec<Arc<BlockModel>> {
        let drained: Vec<_> = write(&self.blocks).drain().map(|(_, b)| b).collect();
        write(&self.parents).clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
        drained
    }

    /// The attached block whose child list names `id`.
    ///
    /// When merged data lists one id under two parents, the parent that
    /// linked it last wins.
    pub(crate) fn parent_of(&self, id: &str) -> Option<Arc<BlockModel>> {
        let parent_id = read(&self.parents).get(id).cloned()?;
        let parent = self.get(&parent_id)?;
        parent.has_child_id(id).then_some(parent)
    }

    /// Replace the links `parent` holds: `old` ids it no longer lists are
    /// released, `new` ids point at it.
    pub(crate) fn relink(&self, parent: &BlockId, old: &[BlockId], new: &[BlockId]) {
        let mut parents = write(&self.parents);
        for child in old {
            if parents.get(child) == Some(parent) {
                parents.remove(child);
            }
        }
        for child in new {
            parents.insert(child.clone(), parent.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn linked_parent(&self, child: &str) -> Option<BlockId> {
        read(&self.parents).get(child).cloned()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn enqueue(&self, event: PendingEvent) {
        lock(&self.pending).push_back(event);
    }

    pub(crate) fn drain_pending(&self) -> Vec<PendingEvent> {
        lock(&self.pending).drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relink_moves_and_releases_children() {
        let index = BlockIndex::new();
        let (p1, p2) = (BlockId::from("p1"), BlockId::from("p2"));
        let (a, b) = (BlockId::from("a"), BlockId::from("b"));

        index.relink(&p1, &[], &[a.clone(), b.clone()]);
        assert_eq!(index.linked_parent("a"), Some(p1.clone()));

        // `a` moves to p2 and p2's update lands first.
        index.relink(&p2, &[], &[a.clone()]);
        index.relink(&p1, &[a.clone(), b.clone()], &[b.clone()]);
        assert_eq!(index.linked_parent("a"), Some(p2.clone()));
        assert_eq!(index.linked_parent("b"), Some(p1.clone()));

        index.relink(&p1, &[b], &[]);
        assert_eq!(index.linked_parent("b"), None);
        assert!(index.parent_of("a").is_none(), "p2 is not in the index");
    }
}
