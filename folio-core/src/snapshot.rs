//! Whole-document export and import.
//!
//! Wire layout: `lz4(size-prepended, bincode(DocumentSnapshot))`. The
//! `update` field is the yrs v1 state update, so a snapshot can also be
//! merged into an existing peer with [`Document::apply_update`].

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::config::DocumentConfig;
use crate::document::Document;
use crate::error::{FolioError, Result};
use crate::schema::Schema;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub format_version: u32,
    pub doc_id: Uuid,
    /// Seconds since epoch
    pub exported_at: u64,
    /// Attached blocks at export time
    pub block_count: u32,
    /// yrs v1 update with the full document state
    pub update: Vec<u8>,
}

impl DocumentSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FolioError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| FolioError::Snapshot(format!("decompression failed: {e}")))?;
        let (snapshot, _): (Self, usize) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| FolioError::Snapshot(format!("malformed snapshot: {e}")))?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(FolioError::Snapshot(format!(
                "unsupported format version {}",
                snapshot.format_version
            )));
        }
        Ok(snapshot)
    }
}

impl Document {
    pub fn snapshot(&self) -> Result<DocumentSnapshot> {
        let exported_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Ok(DocumentSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            doc_id: self.id(),
            exported_at,
            block_count: u32::try_from(self.block_count()).unwrap_or(u32::MAX),
            update: self.encode_state_as_update()?,
        })
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.snapshot()?.encode()
    }

    /// Rebuild a document, keeping the exported document id.
    pub fn import_snapshot(bytes: &[u8], config: DocumentConfig, schema: Schema) -> Result<Self> {
        let snapshot = DocumentSnapshot::decode(bytes)?;
        let mut doc = Document::with_id(snapshot.doc_id, config, schema);
        doc.apply_update(&snapshot.update)?;
        if doc.block_count() != snapshot.block_count as usize {
            return Err(FolioError::Snapshot(format!(
                "expected {} blocks, restored {}",
                snapshot.block_count,
                doc.block_count()
            )));
        }
        log::debug!(
            "Imported document {} with {} blocks",
            snapshot.doc_id,
            snapshot.block_count
        );
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NO_PROPS;
    use serde_json::json;

    #[test]
    fn test_snapshot_restores_tree() {
        let mut doc = Document::new(DocumentConfig::default(), Schema::standard());
        let page = doc.add_block("folio:page", [("title", json!("Notes"))], None, None).unwrap();
        let note = doc.add_block("folio:note", NO_PROPS, Some(&page), None).unwrap();
        let p = doc
            .add_block("folio:paragraph", [("text", json!("kept"))], Some(&note), None)
            .unwrap();

        let bytes = doc.export_snapshot().unwrap();
        let restored =
            Document::import_snapshot(&bytes, DocumentConfig::default(), Schema::standard())
                .unwrap();

        assert_eq!(restored.id(), doc.id());
        assert_eq!(restored.block_count(), 3);
        assert_eq!(restored.root().unwrap().prop("title"), Some(json!("Notes")));
        assert_eq!(restored.get_block(&note).unwrap().child_ids(), vec![p.clone()]);
        assert_eq!(restored.get_block(&p).unwrap().prop("text"), Some(json!("kept")));
        assert!(restored.get_block(&p).unwrap().is_attached());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            DocumentSnapshot::decode(b"definitely not lz4"),
            Err(FolioError::Snapshot(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let snapshot = DocumentSnapshot {
            format_version: 99,
            doc_id: Uuid::nil(),
            exported_at: 0,
            block_count: 0,
            update: Vec::new(),
        };
        let bytes = snapshot.encode().unwrap();
        let err = DocumentSnapshot::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported format version 99"));
    }
}
