//! Durable storage for annotation documents.
//!
//! Only the latest full replicated state is kept per document key. Writes
//! replace the previous snapshot atomically together with its metadata.
//!
//! ```text
//! ┌────────────────────┐  save_snapshot   ┌──────────────────────────────┐
//! │ PersistenceManager │ ───────────────► │ SnapshotStore                │
//! │ (debounced flush)  │                  │ ├── DocumentStore (RocksDB)  │
//! └─────────┬──────────┘                  │ └── MemoryStore   (tests)    │
//!           │ rehydrate                   └──────────────┬───────────────┘
//!           ▼                                            │ column families
//! ┌────────────────────┐              ┌──────────────────┴───────────────┐
//! │ AnnotationStore    │              │ CF "snapshots" - LZ4 full state  │
//! │ (restored)         │              │ CF "metadata"  - bincode records │
//! └────────────────────┘              └──────────────────────────────────┘
//! ```

pub mod memory;
pub mod rocks;

pub use memory::{Failure, MemoryStore};
pub use rocks::{DocumentStore, StoreConfig};

use serde::{Deserialize, Serialize};

use marginalia_core::now_millis;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend rejected the operation for good (corruption, bad options).
    DatabaseError(String),
    /// Backend is busy or timed out; the same write may succeed later.
    Unavailable(String),
    /// No record under this key.
    NotFound(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// I/O error
    IoError(String),
}

impl StoreError {
    /// Whether retrying the same operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::IoError(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Storage unavailable: {e}"),
            StoreError::NotFound(key) => write!(f, "Document not found: {key}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Metadata kept next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub key: String,
    /// Number of snapshots written for this key.
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Milliseconds since epoch
    pub created_at: u64,
    /// Milliseconds since epoch
    pub updated_at: u64,
    /// Collaborator whose edit triggered the latest write.
    pub last_editor: Option<String>,
}

impl DocumentMetadata {
    pub(crate) fn new(key: &str) -> Self {
        let now = now_millis();
        Self {
            key: key.to_string(),
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
            last_editor: None,
        }
    }

    /// Advance the record for a new snapshot.
    pub(crate) fn bump(&mut self, snapshot_size: usize, compressed_size: usize, last_editor: Option<&str>) {
        self.version += 1;
        self.snapshot_size = snapshot_size as u64;
        self.compressed_size = compressed_size as u64;
        self.updated_at = now_millis();
        if let Some(editor) = last_editor {
            self.last_editor = Some(editor.to_string());
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Key-value store of the latest full state per document key.
///
/// Implementations are blocking; async callers run them on the blocking
/// pool.
pub trait SnapshotStore: Send + Sync {
    /// Replace the snapshot for `key`.
    fn save_snapshot(
        &self,
        key: &str,
        snapshot: &[u8],
        last_editor: Option<&str>,
    ) -> Result<DocumentMetadata, StoreError>;

    /// Latest snapshot for `key`, or `None` if it was never saved.
    fn load_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn load_metadata(&self, key: &str) -> Result<Option<DocumentMetadata>, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Every stored document key.
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("busy".into()).is_transient());
        assert!(StoreError::IoError("disk".into()).is_transient());
        assert!(!StoreError::DatabaseError("corrupt".into()).is_transient());
        assert!(!StoreError::CompressionError("bad".into()).is_transient());
    }

    #[test]
    fn test_metadata_bump() {
        let mut meta = DocumentMetadata::new("doc");
        meta.bump(100, 40, Some("ada"));
        meta.bump(120, 45, None);
        assert_eq!(meta.version, 2);
        assert_eq!(meta.snapshot_size, 120);
        assert_eq!(meta.last_editor.as_deref(), Some("ada"));

        let decoded = DocumentMetadata::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }
}
