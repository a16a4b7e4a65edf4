//! The reactive block node.
//!
//! A `BlockModel` is a typed view over one `yrs` map record. It never owns
//! the data: props and child ids are projections that the record's
//! observers keep current, and children are resolved through the shared
//! [`BlockIndex`] on read.
//!
//! ```text
//!  yrs record ──observe──▸ Props signals      ──flush──▸ props_updated
//!  sys:children ─observe─▸ child_ids signal   ──flush──▸ children_updated
//!                               │
//!                      children() / child_map()  (recomputed on read)
//! ```

use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use yrs::types::EntryChange;
use yrs::{Any, Array, ArrayRef, Map, MapRef, Observable, Out, ReadTxn, Subscription};

use super::props::{any_to_json, Props};
use super::{BlockId, Flavour, Role, PROP_PREFIX, SYS_CHILDREN, SYS_FLAVOUR, SYS_ID, SYS_VERSION};
use crate::error::{FolioError, Result};
use crate::index::{BlockIndex, PendingEvent};
use crate::locks::lock;
use crate::reactive::{Derived, Signal};
use crate::schema::Schema;
use crate::slot::{LifecycleSlot, Slot};

/// Lifecycle of a node: `Detached → Attached → Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Detached,
    Attached,
    Disposed,
}

/// Payload of [`BlockModel::props_updated`].
#[derive(Debug, Clone, PartialEq)]
pub struct PropsUpdated {
    pub key: String,
    /// Value after the change; `None` when the key was removed.
    pub value: Option<Value>,
}

/// Dependency stamp of the children projection:
/// (child-id signal version, index generation).
type ChildStamp = (u64, u64);

pub struct BlockModel {
    id: BlockId,
    flavour: Flavour,
    role: Role,
    version: u32,

    record: MapRef,
    children_array: Option<ArrayRef>,
    index: Weak<BlockIndex>,

    child_ids: Signal<Vec<BlockId>>,
    children_cache: Derived<ChildStamp, Vec<Arc<BlockModel>>>,
    child_map_cache: Derived<ChildStamp, Arc<FxHashMap<BlockId, usize>>>,
    props: Props,

    state: Mutex<LifecycleState>,
    subscriptions: Mutex<Vec<Subscription>>,

    created: LifecycleSlot,
    deleted: LifecycleSlot,
    props_updated: Slot<PropsUpdated>,
    children_updated: Slot<Vec<BlockId>>,
}

impl BlockModel {
    /// Build a detached view over `record`.
    ///
    /// Flavours missing from `schema` are accepted as [`Role::Content`] so
    /// that records from peers running a newer schema still show up.
    pub(crate) fn from_record<T: ReadTxn>(
        record: MapRef,
        txn: &T,
        schema: &Schema,
        index: Weak<BlockIndex>,
    ) -> Result<Self> {
        let id = match record.get(txn, SYS_ID) {
            Some(Out::Any(Any::String(s))) => BlockId::from(s.to_string()),
            _ => {
                return Err(FolioError::InvalidRecord {
                    id: "?".to_string(),
                    reason: format!("missing {SYS_ID}"),
                })
            }
        };
        let flavour = match record.get(txn, SYS_FLAVOUR) {
            Some(Out::Any(Any::String(s))) => Flavour::from(s.to_string()),
            _ => {
                return Err(FolioError::InvalidRecord {
                    id: id.to_string(),
                    reason: format!("missing {SYS_FLAVOUR}"),
                })
            }
        };

        let block_schema = schema.get(&flavour);
        let role = match block_schema {
            Some(s) => s.role,
            None => {
                log::warn!("Block {id} has unregistered flavour '{flavour}', treating as content");
                Role::Content
            }
        };
        let version = match record.get(txn, SYS_VERSION) {
            Some(Out::Any(Any::BigInt(v))) => u32::try_from(v).unwrap_or_default(),
            Some(Out::Any(Any::Number(v))) => v as u32,
            _ => block_schema.map(|s| s.version).unwrap_or(1),
        };

        let children_array = match record.get(txn, SYS_CHILDREN) {
            Some(Out::YArray(arr)) => Some(arr),
            _ => {
                log::debug!("Block {id} has no {SYS_CHILDREN} array");
                None
            }
        };
        let child_ids = children_array
            .as_ref()
            .map(|arr| read_child_ids(arr, txn))
            .unwrap_or_default();

        let mut initial = BTreeMap::new();
        for (key, out) in record.iter(txn) {
            if let Some(prop) = key.strip_prefix(PROP_PREFIX) {
                if let Some(value) = out_to_json(&out) {
                    initial.insert(prop.to_string(), value);
                }
            }
        }

        Ok(Self {
            id,
            flavour,
            role,
            version,
            record,
            children_array,
            index,
            child_ids: Signal::new(child_ids),
            children_cache: Derived::new(),
            child_map_cache: Derived::new(),
            props: Props::new(initial),
            state: Mutex::new(LifecycleState::Detached),
            subscriptions: Mutex::new(Vec::new()),
            created: LifecycleSlot::new(),
            deleted: LifecycleSlot::new(),
            props_updated: Slot::new(),
            children_updated: Slot::new(),
        })
    }

    // ---------------------------------------------------------------
    // Identity
    // ---------------------------------------------------------------

    pub fn id(&self) -> &BlockId {
        &self.id
    }

    pub fn flavour(&self) -> &Flavour {
        &self.flavour
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn record(&self) -> &MapRef {
        &self.record
    }

    pub(crate) fn children_array(&self) -> Option<&ArrayRef> {
        self.children_array.as_ref()
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    pub fn is_attached(&self) -> bool {
        self.state() == LifecycleState::Attached
    }

    /// Register observers on the backing record and fire `created`.
    ///
    /// Returns `false` without touching anything unless the node is
    /// `Detached`.
    pub fn attach(self: &Arc<Self>) -> bool {
        let mut state = lock(&self.state);
        if *state != LifecycleState::Detached {
            log::debug!("Ignoring attach of block {} in state {:?}", self.id, *state);
            return false;
        }

        {
            let mut subs = lock(&self.subscriptions);

            let weak = Arc::downgrade(self);
            subs.push(self.record.observe(move |txn, event| {
                let Some(block) = weak.upgrade() else { return };
                let changes: Vec<(String, Option<Value>)> = event
                    .keys(txn)
                    .iter()
                    .filter_map(|(key, change)| {
                        let prop = key.strip_prefix(PROP_PREFIX)?;
                        let value = match change {
                            EntryChange::Inserted(out) | EntryChange::Updated(_, out) => {
                                out_to_json(out)
                            }
                            EntryChange::Removed(_) => None,
                        };
                        Some((prop.to_string(), value))
                    })
                    .collect();
                block.apply_prop_changes(changes);
            }));

            if let Some(arr) = &self.children_array {
                let weak = Arc::downgrade(self);
                subs.push(arr.observe(move |txn, event| {
                    let Some(block) = weak.upgrade() else { return };
                    let ids = read_child_ids(event.target(), txn);
                    block.apply_children_change(ids);
                }));
            }
        }

        *state = LifecycleState::Attached;
        drop(state);
        if let Some(index) = self.index.upgrade() {
            index.relink(&self.id, &[], &self.child_ids.get());
        }
        self.created.fire();
        true
    }

    /// Fire `deleted` and tear down. No-op unless attached.
    pub fn detach(&self) -> bool {
        {
            let state = lock(&self.state);
            if *state != LifecycleState::Attached {
                return false;
            }
        }
        self.deleted.fire();
        self.dispose();
        true
    }

    /// Release every subscription. Safe to call repeatedly.
    pub fn dispose(&self) {
        let was_attached = {
            let mut state = lock(&self.state);
            if *state == LifecycleState::Disposed {
                return;
            }
            let was_attached = *state == LifecycleState::Attached;
            *state = LifecycleState::Disposed;
            was_attached
        };
        lock(&self.subscriptions).clear();
        if was_attached {
            if let Some(index) = self.index.upgrade() {
                index.relink(&self.id, &self.child_ids.get(), &[]);
            }
        }
        self.created.dispose();
        self.deleted.dispose();
        self.props_updated.dispose();
        self.children_updated.dispose();
        self.child_ids.dispose();
        self.props.dispose();
        self.children_cache.invalidate();
        self.child_map_cache.invalidate();
    }

    /// Number of live `yrs` observers held by this node.
    pub fn observer_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    pub fn created(&self) -> &LifecycleSlot {
        &self.created
    }

    pub fn deleted(&self) -> &LifecycleSlot {
        &self.deleted
    }

    pub fn props_updated(&self) -> &Slot<PropsUpdated> {
        &self.props_updated
    }

    pub fn children_updated(&self) -> &Slot<Vec<BlockId>> {
        &self.children_updated
    }

    // ---------------------------------------------------------------
    // Children
    // ---------------------------------------------------------------

    /// Ids exactly as stored in the backing record, resolvable or not.
    pub fn child_ids(&self) -> Vec<BlockId> {
        self.child_ids.get()
    }

    pub fn child_ids_signal(&self) -> Signal<Vec<BlockId>> {
        self.child_ids.clone()
    }

    pub(crate) fn has_child_id(&self, id: &str) -> bool {
        self.child_ids.with(|ids| ids.iter().any(|c| c.as_str() == id))
    }

    /// Resolved children in order. Ids missing from the index are skipped.
    pub fn children(&self) -> Vec<Arc<BlockModel>> {
        let Some(index) = self.index.upgrade() else {
            return Vec::new();
        };
        let stamp = (self.child_ids.version(), index.generation());
        self.children_cache.get(stamp, || {
            self.child_ids
                .with(|ids| ids.iter().filter_map(|id| index.get(id)).collect())
        })
    }

    /// Child id → position among the resolved children.
    pub fn child_map(&self) -> Arc<FxHashMap<BlockId, usize>> {
        let Some(index) = self.index.upgrade() else {
            return Arc::default();
        };
        let stamp = (self.child_ids.version(), index.generation());
        self.child_map_cache.get(stamp, || {
            Arc::new(
                self.children()
                    .iter()
                    .enumerate()
                    .map(|(i, child)| (child.id.clone(), i))
                    .collect(),
            )
        })
    }

    pub fn position_of(&self, child: &str) -> Option<usize> {
        self.child_map().get(child).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.children().is_empty()
    }

    pub fn first_child(&self) -> Option<Arc<BlockModel>> {
        self.children().into_iter().next()
    }

    /// Deepest last descendant, or `self` for a leaf.
    pub fn last_child(self: &Arc<Self>) -> Arc<BlockModel> {
        let mut current = self.clone();
        let mut seen = FxHashSet::default();
        seen.insert(current.id.clone());
        while let Some(next) = current.children().pop() {
            // Concurrent moves can briefly produce a cycle in merged data.
            if !seen.insert(next.id.clone()) {
                break;
            }
            current = next;
        }
        current
    }

    /// Reverse lookup through the owning document.
    pub fn parent(&self) -> Option<Arc<BlockModel>> {
        self.index.upgrade()?.parent_of(&self.id)
    }

    // ---------------------------------------------------------------
    // Props
    // ---------------------------------------------------------------

    pub fn props(&self) -> &Props {
        &self.props
    }

    pub fn prop(&self, key: &str) -> Option<Value> {
        self.props.get(key)
    }

    pub fn prop_signal(&self, key: &str) -> Signal<Option<Value>> {
        self.props.signal(key)
    }

    /// Deserialize the current props into a flavour-specific struct.
    pub fn props_as<P: DeserializeOwned>(&self) -> Result<P> {
        let map: serde_json::Map<String, Value> = self.props.snapshot().into_iter().collect();
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    // ---------------------------------------------------------------
    // Observer callbacks (run inside the yrs commit)
    //
    // Cells are staged here so reads inside the same flush see the new
    // state; subscribers only run from the dispatch methods below.
    // ---------------------------------------------------------------

    fn apply_prop_changes(&self, changes: Vec<(String, Option<Value>)>) {
        if !self.is_attached() || changes.is_empty() {
            return;
        }
        let index = self.index.upgrade();
        for (key, value) in changes {
            // Rewriting the same value is not a change.
            if !self.props.stage(&key, value) {
                continue;
            }
            if let Some(index) = &index {
                index.enqueue(PendingEvent::PropsUpdated {
                    block: self.id.clone(),
                    key,
                });
            }
        }
    }

    fn apply_children_change(&self, ids: Vec<BlockId>) {
        if !self.is_attached() {
            return;
        }
        let old = self.child_ids.get();
        if !self.child_ids.stage(ids) {
            return;
        }
        if let Some(index) = self.index.upgrade() {
            self.child_ids.with(|new| index.relink(&self.id, &old, new));
            index.enqueue(PendingEvent::ChildrenUpdated {
                block: self.id.clone(),
            });
        }
    }

    // ---------------------------------------------------------------
    // Post-commit dispatch
    // ---------------------------------------------------------------

    pub(crate) fn dispatch_props_updated(&self, key: String) {
        if !self.is_attached() {
            return;
        }
        self.props.notify(&key);
        let value = self.props.get(&key);
        self.props_updated.emit(&PropsUpdated { key, value });
    }

    pub(crate) fn dispatch_children_updated(&self) {
        if !self.is_attached() {
            return;
        }
        self.child_ids.notify();
        self.children_updated.emit(&self.child_ids.get());
    }
}

impl fmt::Debug for BlockModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockModel")
            .field("id", &self.id)
            .field("flavour", &self.flavour)
            .field("role", &self.role)
            .field("state", &self.state())
            .field("child_ids", &self.child_ids.get())
            .finish()
    }
}

pub(crate) fn read_child_ids<T: ReadTxn>(arr: &ArrayRef, txn: &T) -> Vec<BlockId> {
    arr.iter(txn)
        .filter_map(|out| match out {
            Out::Any(Any::String(s)) => Some(BlockId::from(s.to_string())),
            _ => None,
        })
        .collect()
}

fn out_to_json(out: &Out) -> Option<Value> {
    match out {
        Out::Any(any) => any_to_json(any),
        _ => {
            log::trace!("Skipping shared-type prop value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yrs::{ArrayPrelim, Doc, MapPrelim, Transact};

    /// A bare yrs doc with one record, outside of any `Document`.
    fn standalone_record(doc: &Doc, id: &str, flavour: &str) -> MapRef {
        let blocks = doc.get_or_insert_map("blocks");
        let mut txn = doc.transact_mut();
        let record: MapRef = blocks.insert(&mut txn, id, MapPrelim::default());
        record.insert(&mut txn, SYS_ID, id);
        record.insert(&mut txn, SYS_FLAVOUR, flavour);
        record.insert(&mut txn, SYS_VERSION, Any::BigInt(2));
        record.insert(&mut txn, SYS_CHILDREN, ArrayPrelim::default());
        record.insert(&mut txn, "prop:text", "hello");
        record
    }

    fn standalone_block(doc: &Doc, id: &str) -> Arc<BlockModel> {
        let record = standalone_record(doc, id, "folio:paragraph");
        let txn = doc.transact();
        let block = BlockModel::from_record(record, &txn, &Schema::standard(), Weak::new())
            .expect("valid record");
        Arc::new(block)
    }

    #[test]
    fn test_from_record_reads_identity_and_props() {
        let doc = Doc::new();
        let block = standalone_block(&doc, "p1");
        assert_eq!(block.id().as_str(), "p1");
        assert_eq!(block.flavour().as_str(), "folio:paragraph");
        assert_eq!(block.role(), Role::Content);
        assert_eq!(block.version(), 2);
        assert_eq!(block.prop("text"), Some(serde_json::json!("hello")));
        assert_eq!(block.state(), LifecycleState::Detached);
    }

    #[test]
    fn test_from_record_rejects_missing_flavour() {
        let doc = Doc::new();
        let blocks = doc.get_or_insert_map("blocks");
        let record: MapRef = {
            let mut txn = doc.transact_mut();
            let record: MapRef = blocks.insert(&mut txn, "x", MapPrelim::default());
            record.insert(&mut txn, SYS_ID, "x");
            record
        };
        let txn = doc.transact();
        let err = BlockModel::from_record(record, &txn, &Schema::standard(), Weak::new())
            .unwrap_err();
        assert!(matches!(err, FolioError::InvalidRecord { .. }));
    }

    #[test]
    fn test_unknown_flavour_degrades_to_content() {
        let doc = Doc::new();
        let record = standalone_record(&doc, "u", "plugin:kanban");
        let txn = doc.transact();
        let block = BlockModel::from_record(record, &txn, &Schema::standard(), Weak::new())
            .unwrap();
        assert_eq!(block.role(), Role::Content);
    }

    #[test]
    fn test_attach_is_idempotent() {
        let doc = Doc::new();
        let block = standalone_block(&doc, "p1");
        let created = Arc::new(AtomicUsize::new(0));
        let c = created.clone();
        let _h = block.created().on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(block.attach());
        let observers = block.observer_count();
        assert_eq!(observers, 2);

        assert!(!block.attach());
        assert_eq!(block.observer_count(), observers);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observers_keep_projection_in_sync() {
        let doc = Doc::new();
        let block = standalone_block(&doc, "p1");
        block.attach();
        {
            let mut txn = doc.transact_mut();
            block.record().insert(&mut txn, "prop:text", "changed");
            block.children_array().unwrap().push_back(&mut txn, "c1");
        }
        assert_eq!(block.prop("text"), Some(serde_json::json!("changed")));
        assert_eq!(block.child_ids(), vec![BlockId::from("c1")]);
        // No index: the id cannot resolve, so the node looks childless.
        assert!(block.is_empty());
    }

    #[test]
    fn test_disposed_block_ignores_record_changes() {
        let doc = Doc::new();
        let block = standalone_block(&doc, "p1");
        block.attach();
        block.dispose();
        block.dispose();
        assert_eq!(block.state(), LifecycleState::Disposed);
        assert_eq!(block.observer_count(), 0);
        assert!(!block.attach());

        {
            let mut txn = doc.transact_mut();
            block.record().insert(&mut txn, "prop:text", "ignored");
        }
        assert_eq!(block.prop("text"), Some(serde_json::json!("hello")));
    }

    #[test]
    fn test_detach_fires_deleted_once() {
        let doc = Doc::new();
        let block = standalone_block(&doc, "p1");
        let deleted = Arc::new(AtomicUsize::new(0));
        let d = deleted.clone();
        let _h = block.deleted().on(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!block.detach());
        block.attach();
        assert!(block.detach());
        assert!(!block.detach());
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
        assert_eq!(block.state(), LifecycleState::Disposed);
    }

    #[test]
    fn test_props_as_typed_struct() {
        #[derive(serde::Deserialize)]
        struct Paragraph {
            text: String,
        }
        let doc = Doc::new();
        let block = standalone_block(&doc, "p1");
        let p: Paragraph = block.props_as().unwrap();
        assert_eq!(p.text, "hello");
    }
}
