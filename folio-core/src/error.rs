use thiserror::Error;

use crate::block::{BlockId, Flavour};

/// Errors produced by document, schema and snapshot operations.
///
/// Reactive reads on a [`BlockModel`](crate::BlockModel) never fail; lookup
/// misses there degrade to "child not present".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FolioError {
    #[error("Unknown flavour: {0}")]
    UnknownFlavour(Flavour),

    #[error("Flavour already registered: {0}")]
    DuplicateFlavour(Flavour),

    #[error("Block not found: {0}")]
    BlockNotFound(BlockId),

    #[error("Block id already in use: {0}")]
    DuplicateBlock(BlockId),

    #[error("Document already has a root block: {0}")]
    RootExists(BlockId),

    #[error("Schema violation: '{child}' cannot be placed under {parent}: {reason}")]
    SchemaViolation {
        parent: String,
        child: Flavour,
        reason: String,
    },

    #[error("Index {index} out of bounds for {len} children")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Moving {block} under {target} would create a cycle")]
    Cycle { block: BlockId, target: BlockId },

    #[error("Invalid block record '{id}': {reason}")]
    InvalidRecord { id: String, reason: String },

    #[error("Document has been disposed")]
    Disposed,

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Update error: {0}")]
    Update(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl From<yrs::encoding::read::Error> for FolioError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        FolioError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for FolioError {
    fn from(e: serde_json::Error) -> Self {
        FolioError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FolioError>;
