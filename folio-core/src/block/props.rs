use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use yrs::Any;

use crate::error::{FolioError, Result};
use crate::locks::{read, write};
use crate::reactive::Signal;

/// Flavour-specific key/value payload of a block.
///
/// Every key owns a [`Signal`] so the view layer can bind to one prop
/// without re-rendering on unrelated changes. A signal handed out for a key
/// that is not set yet holds `None` and fires once the key appears.
#[derive(Debug, Default)]
pub struct Props {
    cells: RwLock<BTreeMap<String, Signal<Option<Value>>>>,
}

impl Props {
    pub(crate) fn new(initial: BTreeMap<String, Value>) -> Self {
        let cells = initial
            .into_iter()
            .map(|(k, v)| (k, Signal::new(Some(v))))
            .collect();
        Self {
            cells: RwLock::new(cells),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        read(&self.cells).get(key).and_then(|cell| cell.get())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Observable cell for `key`, created on first request.
    pub fn signal(&self, key: &str) -> Signal<Option<Value>> {
        if let Some(cell) = read(&self.cells).get(key) {
            return cell.clone();
        }
        write(&self.cells)
            .entry(key.to_string())
            .or_insert_with(|| Signal::new(None))
            .clone()
    }

    /// Store a value without notifying the key's subscribers. Returns
    /// whether the stored value changed.
    pub(crate) fn stage(&self, key: &str, value: Option<Value>) -> bool {
        self.signal(key).stage(value)
    }

    /// Run the subscribers of `key` with its current value.
    pub(crate) fn notify(&self, key: &str) {
        // Cell is cloned out so subscribers run without the map lock.
        let cell = read(&self.cells).get(key).cloned();
        if let Some(cell) = cell {
            cell.notify();
        }
    }

    /// Every key that currently has a value.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        read(&self.cells)
            .iter()
            .filter_map(|(k, cell)| cell.get().map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.snapshot().into_keys().collect()
    }

    pub(crate) fn dispose(&self) {
        for cell in read(&self.cells).values() {
            cell.dispose();
        }
    }
}

pub(crate) fn json_to_any(value: &Value) -> Result<Any> {
    serde_json::from_value(value.clone()).map_err(|e| FolioError::Serialization(e.to_string()))
}

pub(crate) fn any_to_json(any: &Any) -> Option<Value> {
    match serde_json::to_value(any) {
        Ok(v) => Some(v),
        Err(e) => {
            log::debug!("Prop value not representable as JSON: {e}");
            None
        }
    }
}
