//! Flavour registry and placement rules.
//!
//! Role rules apply first:
//!
//! | child role | allowed parent roles |
//! |------------|----------------------|
//! | Root       | none                 |
//! | Hub        | Root, Hub            |
//! | Content    | Hub, Content         |
//!
//! Then the optional `parents` list of the child and `children` list of the
//! parent narrow it down. List entries are flavours or `prefix*` globs.

use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::block::{Flavour, Role};
use crate::error::{FolioError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct BlockSchema {
    pub flavour: Flavour,
    pub role: Role,
    pub version: u32,
    /// Flavours this block may be placed under. `None` means any.
    pub parents: Option<Vec<String>>,
    /// Flavours this block accepts as children. `None` means any.
    pub children: Option<Vec<String>>,
    /// Props written when a block is added without them.
    pub default_props: BTreeMap<String, Value>,
}

impl BlockSchema {
    pub fn new(flavour: impl Into<Flavour>, role: Role) -> Self {
        Self {
            flavour: flavour.into(),
            role,
            version: 1,
            parents: None,
            children: None,
            default_props: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents = Some(parents.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = Some(children.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_default_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.default_props.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    flavours: FxHashMap<Flavour, BlockSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in page/note/paragraph/list/code/divider flavours.
    pub fn standard() -> Self {
        let mut schema = Self::new();
        let builtins = [
            BlockSchema::new("folio:page", Role::Root)
                .with_children(["folio:note"])
                .with_default_prop("title", json!("")),
            BlockSchema::new("folio:note", Role::Hub).with_parents(["folio:page"]),
            BlockSchema::new("folio:paragraph", Role::Content)
                .with_default_prop("type", json!("text"))
                .with_default_prop("text", json!("")),
            BlockSchema::new("folio:list", Role::Content)
                .with_default_prop("type", json!("bulleted"))
                .with_default_prop("text", json!(""))
                .with_default_prop("checked", json!(false)),
            BlockSchema::new("folio:code", Role::Content)
                .with_children(Vec::<String>::new())
                .with_default_prop("language", json!("plain"))
                .with_default_prop("text", json!("")),
            BlockSchema::new("folio:divider", Role::Content).with_children(Vec::<String>::new()),
        ];
        for block in builtins {
            schema.flavours.insert(block.flavour.clone(), block);
        }
        schema
    }

    pub fn register(&mut self, block: BlockSchema) -> Result<()> {
        if self.flavours.contains_key(&block.flavour) {
            return Err(FolioError::DuplicateFlavour(block.flavour));
        }
        log::debug!("Registered flavour {} ({})", block.flavour, block.role);
        self.flavours.insert(block.flavour.clone(), block);
        Ok(())
    }

    pub fn get(&self, flavour: &str) -> Option<&BlockSchema> {
        self.flavours.get(flavour)
    }

    pub fn contains(&self, flavour: &str) -> bool {
        self.flavours.contains_key(flavour)
    }

    pub fn len(&self) -> usize {
        self.flavours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flavours.is_empty()
    }

    /// Check that `child` may sit under `parent` (`None` = top level).
    pub fn validate(&self, parent: Option<&str>, child: &str) -> Result<()> {
        let child_schema = self
            .get(child)
            .ok_or_else(|| FolioError::UnknownFlavour(Flavour::from(child)))?;

        let Some(parent) = parent else {
            if child_schema.role == Role::Root {
                return Ok(());
            }
            return Err(violation("<none>", child, "only root blocks can be top level"));
        };

        let parent_schema = self
            .get(parent)
            .ok_or_else(|| FolioError::UnknownFlavour(Flavour::from(parent)))?;

        let role_ok = match child_schema.role {
            Role::Root => false,
            Role::Hub => matches!(parent_schema.role, Role::Root | Role::Hub),
            Role::Content => matches!(parent_schema.role, Role::Hub | Role::Content),
        };
        if !role_ok {
            return Err(violation(
                parent,
                child,
                &format!(
                    "{} block cannot be a child of a {} block",
                    child_schema.role, parent_schema.role
                ),
            ));
        }

        if let Some(parents) = &child_schema.parents {
            if !parents.iter().any(|p| parent_schema.flavour.matches(p)) {
                return Err(violation(parent, child, "parent not in the child's allowed parents"));
            }
        }
        if let Some(children) = &parent_schema.children {
            if !children.iter().any(|c| child_schema.flavour.matches(c)) {
                return Err(violation(parent, child, "child not in the parent's allowed children"));
            }
        }
        Ok(())
    }
}

fn violation(parent: &str, child: &str, reason: &str) -> FolioError {
    FolioError::SchemaViolation {
        parent: parent.to_string(),
        child: Flavour::from(child),
        reason: reason.to_string(),
    }
}
