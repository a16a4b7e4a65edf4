//! Document: the owner of the `yrs::Doc`, the block index and the mutation API.
//!
//! ```text
//!  local mutation ─┐                       ┌─▸ attach / detach BlockModels
//!                  ├─▸ yrs txn ─commit─▸ observers ─▸ pending queue ─flush─┤
//!  apply_update ───┘                       └─▸ props_updated, children_updated,
//!                                              block_added, block_deleted
//! ```
//!
//! Observers only record what happened; listeners run from [`Document::flush`]
//! once the transaction is gone, so they may freely read the tree.
//!
//! `yrs` cannot roll a transaction back, so every mutation validates its
//! inputs before opening one.

use rustc_hash::FxHashSet;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;
use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, Map, MapPrelim, MapRef, Observable, Out, ReadTxn,
    StateVector, Subscription, Transact, TransactionMut, Update,
};

use crate::block::{
    json_to_any, BlockId, BlockModel, Role, PROP_PREFIX, SYS_CHILDREN, SYS_FLAVOUR, SYS_ID,
    SYS_VERSION,
};
use crate::config::DocumentConfig;
use crate::error::{FolioError, Result};
use crate::index::{BlockIndex, PendingEvent};
use crate::schema::Schema;
use crate::slot::Slot;

/// Empty prop list for [`Document::add_block`].
pub const NO_PROPS: [(&str, Value); 0] = [];

/// How [`Document::delete_block`] treats the deleted block's children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Re-insert the children into the parent at the deleted block's
    /// position instead of deleting the whole subtree.
    pub bring_children_to_parent: bool,
}

pub struct Document {
    id: Uuid,
    config: DocumentConfig,
    schema: Arc<Schema>,

    doc: Doc,
    blocks: MapRef,
    index: Arc<BlockIndex>,
    root_id: Option<BlockId>,

    root_subscription: Option<Subscription>,
    disposed: bool,

    block_added: Slot<BlockId>,
    block_deleted: Slot<BlockId>,
}

impl Document {
    pub fn new(config: DocumentConfig, schema: Schema) -> Self {
        Self::with_id(Uuid::new_v4(), config, schema)
    }

    pub fn with_id(id: Uuid, config: DocumentConfig, schema: Schema) -> Self {
        let doc = Doc::new();
        let blocks = doc.get_or_insert_map(config.blocks_key.as_str());
        let index = Arc::new(BlockIndex::new());

        let weak = Arc::downgrade(&index);
        let root_subscription = blocks.observe(move |txn, event| {
            let Some(index) = weak.upgrade() else { return };
            for (key, change) in event.keys(txn) {
                let block = BlockId::from(key.to_string());
                match change {
                    EntryChange::Inserted(_) => index.enqueue(PendingEvent::Added(block)),
                    EntryChange::Removed(_) => index.enqueue(PendingEvent::Removed(block)),
                    EntryChange::Updated(_, _) => {
                        index.enqueue(PendingEvent::Removed(block.clone()));
                        index.enqueue(PendingEvent::Added(block));
                    }
                }
            }
        });

        log::debug!("Created document {id} (blocks map '{}')", config.blocks_key);
        Self {
            id,
            config,
            schema: Arc::new(schema),
            doc,
            blocks,
            index,
            root_id: None,
            root_subscription: Some(root_subscription),
            disposed: false,
            block_added: Slot::new(),
            block_deleted: Slot::new(),
        }
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The underlying CRDT document, for integrations that share it.
    ///
    /// Changes made through it are picked up on the next [`flush`](Self::flush).
    pub fn yrs_doc(&self) -> &Doc {
        &self.doc
    }

    pub fn blocks_map(&self) -> &MapRef {
        &self.blocks
    }

    /// Fired after a block has been attached.
    pub fn block_added(&self) -> &Slot<BlockId> {
        &self.block_added
    }

    /// Fired after a block has been detached.
    pub fn block_deleted(&self) -> &Slot<BlockId> {
        &self.block_deleted
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ---------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------

    pub fn get_block(&self, id: &str) -> Option<Arc<BlockModel>> {
        self.index.get(id)
    }

    pub fn has_block(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn get_parent(&self, id: &str) -> Option<Arc<BlockModel>> {
        self.index.parent_of(id)
    }

    pub fn root(&self) -> Option<Arc<BlockModel>> {
        self.root_id.as_deref().and_then(|id| self.index.get(id))
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    pub fn blocks_by_flavour(&self, flavour: &str) -> Vec<Arc<BlockModel>> {
        self.index
            .all()
            .into_iter()
            .filter(|b| b.flavour().as_str() == flavour)
            .collect()
    }

    pub fn prev_sibling(&self, id: &str) -> Option<Arc<BlockModel>> {
        let parent = self.get_parent(id)?;
        let pos = parent.position_of(id)?;
        let prev = pos.checked_sub(1)?;
        parent.children().get(prev).cloned()
    }

    pub fn next_sibling(&self, id: &str) -> Option<Arc<BlockModel>> {
        let parent = self.get_parent(id)?;
        let pos = parent.position_of(id)?;
        parent.children().get(pos + 1).cloned()
    }

    /// Bumped whenever a block joins or leaves the index.
    pub fn index_generation(&self) -> u64 {
        self.index.generation()
    }

    // ---------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------

    /// Add a block with a generated id. `index` defaults to the end of the
    /// parent's children.
    pub fn add_block<I, K>(
        &mut self,
        flavour: &str,
        props: I,
        parent: Option<&BlockId>,
        index: Option<usize>,
    ) -> Result<BlockId>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.add_block_with_id(BlockId::generate(), flavour, props, parent, index)
    }

    pub fn add_block_with_id<I, K>(
        &mut self,
        id: BlockId,
        flavour: &str,
        props: I,
        parent: Option<&BlockId>,
        index: Option<usize>,
    ) -> Result<BlockId>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.ensure_live()?;
        if self.index.contains(&id) || self.record_exists(&id)? {
            return Err(FolioError::DuplicateBlock(id));
        }
        let block_schema = self
            .schema
            .get(flavour)
            .ok_or_else(|| FolioError::UnknownFlavour(flavour.into()))?
            .clone();
        if block_schema.role == Role::Root {
            if let Some(root) = &self.root_id {
                return Err(FolioError::RootExists(root.clone()));
            }
        }

        let parent_block = parent.map(|p| self.require(p)).transpose()?;
        if self.config.validate_schema {
            self.schema
                .validate(parent_block.as_ref().map(|b| b.flavour().as_str()), flavour)?;
        }
        let placement = match &parent_block {
            Some(p) => {
                let arr = children_array_of(p)?;
                let at = insertion_index(index, p.child_ids().len())?;
                Some((arr, at))
            }
            None => None,
        };

        let mut merged: BTreeMap<String, Value> = if self.config.apply_default_props {
            block_schema.default_props.clone()
        } else {
            BTreeMap::new()
        };
        merged.extend(props.into_iter().map(|(k, v)| (k.into(), v)));
        let encoded = encode_props(merged)?;

        {
            let mut txn = self.transact_mut()?;
            let record: MapRef = self.blocks.insert(&mut txn, id.as_str(), MapPrelim::default());
            record.insert(&mut txn, SYS_ID, id.as_str());
            record.insert(&mut txn, SYS_FLAVOUR, flavour);
            record.insert(
                &mut txn,
                SYS_VERSION,
                Any::BigInt(i64::from(block_schema.version)),
            );
            let _children: ArrayRef =
                record.insert(&mut txn, SYS_CHILDREN, ArrayPrelim::default());
            for (key, value) in encoded {
                record.insert(&mut txn, key, value);
            }
            if let Some((arr, at)) = &placement {
                arr.insert(&mut txn, *at as u32, id.as_str());
            }
        }

        self.flush();
        log::debug!("Added block {id} ({flavour})");
        Ok(id)
    }

    /// Write props; a `Value::Null` is stored as null, not removed.
    pub fn update_props<I, K>(&mut self, id: &str, props: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.ensure_live()?;
        let block = self.require(id)?;
        let encoded = encode_props(props.into_iter().map(|(k, v)| (k.into(), v)))?;
        if encoded.is_empty() {
            return Ok(());
        }
        {
            let mut txn = self.transact_mut()?;
            for (key, value) in encoded {
                block.record().insert(&mut txn, key, value);
            }
        }
        self.flush();
        Ok(())
    }

    /// Returns whether the prop existed.
    pub fn remove_prop(&mut self, id: &str, key: &str) -> Result<bool> {
        self.ensure_live()?;
        let block = self.require(id)?;
        let existed = {
            let mut txn = self.transact_mut()?;
            block
                .record()
                .remove(&mut txn, &format!("{PROP_PREFIX}{key}"))
                .is_some()
        };
        self.flush();
        Ok(existed)
    }

    /// Delete a block. Returns the ids of every removed record.
    pub fn delete_block(&mut self, id: &str, options: DeleteOptions) -> Result<Vec<BlockId>> {
        self.ensure_live()?;
        let block = self.require(id)?;
        let parent = self.index.parent_of(id);
        let child_ids = block.child_ids();
        let rehome = options.bring_children_to_parent && !child_ids.is_empty();

        if rehome {
            let Some(parent) = &parent else {
                return Err(FolioError::SchemaViolation {
                    parent: "<none>".to_string(),
                    child: block.flavour().clone(),
                    reason: "children of a top-level block have nowhere to go".to_string(),
                });
            };
            if self.config.validate_schema {
                for child in block.children() {
                    self.schema
                        .validate(Some(parent.flavour().as_str()), child.flavour())?;
                }
            }
        }

        let mut removed = vec![block.id().clone()];
        if !rehome {
            removed.extend(self.descendants(block.id()));
        }
        let slot = match &parent {
            Some(p) => match p.child_ids().iter().position(|c| c.as_str() == id) {
                Some(pos) => Some((children_array_of(p)?, pos)),
                None => None,
            },
            None => None,
        };

        {
            let mut txn = self.transact_mut()?;
            if let Some((arr, pos)) = &slot {
                arr.remove(&mut txn, *pos as u32);
                if rehome {
                    for (offset, child) in child_ids.iter().enumerate() {
                        arr.insert(&mut txn, (pos + offset) as u32, child.as_str());
                    }
                }
            }
            for rid in &removed {
                self.blocks.remove(&mut txn, rid.as_str());
            }
        }

        self.flush();
        log::debug!("Deleted {} block(s) rooted at {id}", removed.len());
        Ok(removed)
    }

    /// Move a block under `new_parent`. `index` is the position in the
    /// target's child list once the block has been taken out of its old slot.
    pub fn move_block(
        &mut self,
        id: &str,
        new_parent: &BlockId,
        index: Option<usize>,
    ) -> Result<()> {
        self.ensure_live()?;
        let block = self.require(id)?;
        let target = self.require(new_parent)?;
        if block.role() == Role::Root {
            return Err(FolioError::SchemaViolation {
                parent: target.flavour().to_string(),
                child: block.flavour().clone(),
                reason: "the root block cannot be moved".to_string(),
            });
        }
        if target.id().as_str() == id || self.is_ancestor(id, target.id()) {
            return Err(FolioError::Cycle {
                block: block.id().clone(),
                target: target.id().clone(),
            });
        }
        if self.config.validate_schema {
            self.schema
                .validate(Some(target.flavour().as_str()), block.flavour())?;
        }

        let old_slot = match self.index.parent_of(id) {
            Some(p) => {
                let pos = p.child_ids().iter().position(|c| c.as_str() == id);
                match pos {
                    Some(pos) => Some((p.clone(), children_array_of(&p)?, pos)),
                    None => None,
                }
            }
            None => None,
        };
        let same_parent = old_slot
            .as_ref()
            .is_some_and(|(p, _, _)| p.id() == target.id());
        let len_after = target.child_ids().len() - usize::from(same_parent);
        let at = insertion_index(index, len_after)?;
        let target_arr = children_array_of(&target)?;

        {
            let mut txn = self.transact_mut()?;
            if let Some((_, arr, pos)) = &old_slot {
                arr.remove(&mut txn, *pos as u32);
            }
            target_arr.insert(&mut txn, at as u32, id);
        }

        self.flush();
        log::debug!("Moved block {id} under {new_parent} at {at}");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Collaboration
    // ---------------------------------------------------------------

    pub fn state_vector(&self) -> Result<Vec<u8>> {
        let txn = self.transact()?;
        Ok(txn.state_vector().encode_v1())
    }

    /// Full document state as one update.
    pub fn encode_state_as_update(&self) -> Result<Vec<u8>> {
        let txn = self.transact()?;
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Changes the peer owning `remote_state_vector` has not seen yet.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)?;
        let txn = self.transact()?;
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Merge a remote update. Returns the number of events dispatched.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<usize> {
        self.ensure_live()?;
        let update = Update::decode_v1(update)?;
        {
            let mut txn = self.transact_mut()?;
            txn.apply_update(update)
                .map_err(|e| FolioError::Update(e.to_string()))?;
        }
        Ok(self.flush())
    }

    // ---------------------------------------------------------------
    // Event flush
    // ---------------------------------------------------------------

    /// Drain events recorded by the `yrs` observers and dispatch them.
    ///
    /// Called by every mutating method; call it directly after writing to
    /// [`yrs_doc`](Self::yrs_doc) from outside. Returns the number of events.
    pub fn flush(&mut self) -> usize {
        let mut processed = 0;
        for _ in 0..self.config.max_flush_rounds.max(1) {
            let batch = self.index.drain_pending();
            if batch.is_empty() {
                return processed;
            }
            processed += batch.len();
            // Attach and detach first so notifications see the settled tree.
            let (membership, notifications): (Vec<_>, Vec<_>) = batch.into_iter().partition(|e| {
                matches!(e, PendingEvent::Added(_) | PendingEvent::Removed(_))
            });
            for event in membership.into_iter().chain(notifications) {
                self.dispatch(event);
            }
        }
        log::warn!(
            "Document {}: flush stopped after {} rounds with events pending",
            self.id,
            self.config.max_flush_rounds
        );
        processed
    }

    fn dispatch(&mut self, event: PendingEvent) {
        if self.disposed {
            return;
        }
        match event {
            PendingEvent::Added(id) => self.attach_block(&id),
            PendingEvent::Removed(id) => self.detach_block(&id),
            PendingEvent::PropsUpdated { block, key } => {
                if let Some(b) = self.index.get(&block) {
                    b.dispatch_props_updated(key);
                }
            }
            PendingEvent::ChildrenUpdated { block } => {
                if let Some(b) = self.index.get(&block) {
                    b.dispatch_children_updated();
                }
            }
        }
    }

    fn attach_block(&mut self, id: &BlockId) {
        let block = {
            let txn = match self.transact() {
                Ok(txn) => txn,
                Err(e) => {
                    log::warn!("Cannot attach block {id}: {e}");
                    return;
                }
            };
            let record = match self.blocks.get(&txn, id.as_str()) {
                Some(Out::YMap(record)) => record,
                Some(_) => {
                    log::warn!("Block entry {id} is not a map, ignoring");
                    return;
                }
                None => {
                    log::debug!("Block {id} removed before it could be attached");
                    return;
                }
            };
            match BlockModel::from_record(record, &txn, &self.schema, Arc::downgrade(&self.index))
            {
                Ok(block) => Arc::new(block),
                Err(e) => {
                    log::warn!("Skipping block {id}: {e}");
                    return;
                }
            }
        };

        if let Some(previous) = self.index.insert(block.clone()) {
            previous.detach();
        }
        if block.role() == Role::Root {
            let second_root = matches!(&self.root_id, Some(existing) if existing != id);
            if second_root {
                log::warn!("Document {} has a second root {id}, keeping the first", self.id);
            } else {
                self.root_id = Some(id.clone());
            }
        }
        block.attach();
        self.block_added.emit(id);
    }

    fn detach_block(&mut self, id: &BlockId) {
        let Some(block) = self.index.remove(id) else {
            return;
        };
        if self.root_id.as_ref() == Some(id) {
            self.root_id = None;
        }
        block.detach();
        self.block_deleted.emit(id);
    }

    // ---------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------

    /// Stop observing and dispose every block. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.root_subscription.take();
        self.index.drain_pending();
        for block in self.index.clear() {
            block.dispose();
        }
        self.root_id = None;
        self.block_added.dispose();
        self.block_deleted.dispose();
        log::debug!("Disposed document {}", self.id);
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(FolioError::Disposed);
        }
        Ok(())
    }

    fn require(&self, id: &str) -> Result<Arc<BlockModel>> {
        self.index
            .get(id)
            .ok_or_else(|| FolioError::BlockNotFound(id.into()))
    }

    fn transact(&self) -> Result<yrs::Transaction<'_>> {
        self.doc
            .try_transact()
            .map_err(|e| FolioError::Transaction(format!("{e:?}")))
    }

    fn transact_mut(&self) -> Result<TransactionMut<'_>> {
        self.doc
            .try_transact_mut()
            .map_err(|e| FolioError::Transaction(format!("{e:?}")))
    }

    fn record_exists(&self, id: &str) -> Result<bool> {
        let txn = self.transact()?;
        Ok(self.blocks.contains_key(&txn, id))
    }

    /// Every id reachable below `id`, depth first.
    fn descendants(&self, id: &str) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut seen = FxHashSet::default();
        let mut stack: Vec<BlockId> = self
            .index
            .get(id)
            .map(|b| b.child_ids())
            .unwrap_or_default();
        stack.reverse();
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(block) = self.index.get(&next) {
                let mut kids = block.child_ids();
                kids.reverse();
                stack.extend(kids);
            }
            out.push(next);
        }
        out
    }

    /// Whether `ancestor` appears on the parent chain of `node`.
    fn is_ancestor(&self, ancestor: &str, node: &str) -> bool {
        let mut seen = FxHashSet::default();
        let mut current = self.index.parent_of(node);
        while let Some(block) = current {
            if block.id().as_str() == ancestor {
                return true;
            }
            if !seen.insert(block.id().clone()) {
                return false;
            }
            current = self.index.parent_of(block.id());
        }
        false
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("root_id", &self.root_id)
            .field("blocks", &self.index.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}

fn insertion_index(index: Option<usize>, len: usize) -> Result<usize> {
    match index {
        None => Ok(len),
        Some(i) if i <= len => Ok(i),
        Some(i) => Err(FolioError::IndexOutOfBounds { index: i, len }),
    }
}

fn children_array_of(block: &BlockModel) -> Result<ArrayRef> {
    block
        .children_array()
        .cloned()
        .ok_or_else(|| FolioError::InvalidRecord {
            id: block.id().to_string(),
            reason: format!("missing {SYS_CHILDREN}"),
        })
}

fn encode_props(props: impl IntoIterator<Item = (String, Value)>) -> Result<Vec<(String, Any)>> {
    props
        .into_iter()
        .map(|(k, v)| Ok((format!("{PROP_PREFIX}{k}"), json_to_any(&v)?)))
        .collect()
}
