use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Document configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Name of the root `yrs` map holding block records (default: "blocks").
    /// Peers must agree on it to see each other's blocks.
    pub blocks_key: String,
    /// Enforce schema placement rules on local mutations (default: true)
    pub validate_schema: bool,
    /// Write the flavour's default props for keys missing on add (default: true)
    pub apply_default_props: bool,
    /// Upper bound on flush rounds per mutation (default: 64)
    pub max_flush_rounds: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            blocks_key: "blocks".to_string(),
            validate_schema: true,
            apply_default_props: true,
            max_flush_rounds: 64,
        }
    }
}

impl DocumentConfig {
    /// Permissive config for tests that build trees the schema would reject.
    pub fn for_testing() -> Self {
        Self {
            validate_schema: false,
            apply_default_props: false,
            ..Self::default()
        }
    }

    /// Parse from JSON; missing fields fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
