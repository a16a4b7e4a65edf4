//! Block identity types and the reactive [`BlockModel`].

mod model;
mod props;

pub use model::{BlockModel, LifecycleState, PropsUpdated};
pub use props::Props;

pub(crate) use props::json_to_any;

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

/// Record keys of the backing `yrs` map.
pub(crate) const SYS_ID: &str = "sys:id";
pub(crate) const SYS_FLAVOUR: &str = "sys:flavour";
pub(crate) const SYS_VERSION: &str = "sys:version";
pub(crate) const SYS_CHILDREN: &str = "sys:children";
pub(crate) const PROP_PREFIX: &str = "prop:";

/// Block identifier, unique within one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for BlockId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for BlockId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Semantic type tag of a block, e.g. `folio:paragraph`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flavour(String);

impl Flavour {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exact match, or prefix match when `pattern` ends in `*`.
    pub fn matches(&self, pattern: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.0.starts_with(prefix),
            None => self.0 == pattern,
        }
    }
}

impl Deref for Flavour {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Flavour {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Flavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Flavour {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Flavour {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Structural category of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Top of the tree; exactly one per document.
    Root,
    /// Container that groups other blocks (notes, sections).
    Hub,
    /// Leaf-ish content (paragraphs, list items, code).
    Content,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Root => "root",
            Role::Hub => "hub",
            Role::Content => "content",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = BlockId::generate();
        let b = BlockId::generate();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_flavour_glob_matching() {
        let f = Flavour::from("folio:list");
        assert!(f.matches("folio:list"));
        assert!(f.matches("folio:*"));
        assert!(!f.matches("folio:paragraph"));
        assert!(!f.matches("other:*"));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Hub).unwrap();
        assert_eq!(json, "\"hub\"");
        let role: Role = serde_json::from_str("\"content\"").unwrap();
        assert_eq!(role, Role::Content);
    }
}
