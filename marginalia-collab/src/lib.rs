//! # marginalia-collab: Replicated annotation documents
//!
//! Holds the live, conflict-free annotation state of each document and keeps
//! it durable. Transport is external: replicas exchange the opaque update
//! blobs produced here over whatever channel the host provides.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  updates (bytes)  ┌──────────────┐
//! │ Workspace A  │ ◄───────────────► │ Workspace B  │   (other process)
//! └──────┬───────┘    transport      └──────────────┘
//!        │ mutate / apply_remote
//!        ▼
//! ┌─────────────────┐  mark_dirty  ┌────────────────────┐  save_snapshot  ┌───────────────┐
//! │ AnnotationStore │ ───────────► │ PersistenceManager │ ──────────────► │ SnapshotStore │
//! │ (Yrs Doc)       │              │ debounce / retry   │                 │ RocksDB + LZ4 │
//! └──────┬──────────┘              └─────────┬──────────┘                 └───────────────┘
//!        │ owned by                        │ evict
//!        ▼                                 ▼
//! ┌──────────────────────────────────────────────┐
//! │ DocumentRegistry  key → Arc<Mutex<Store>>    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: The replicated annotation store
//! - [`envelope`]: Checksummed framing for update and snapshot blobs
//! - [`presence`]: Ephemeral cursors and selections
//! - [`storage`]: Snapshot storage backends
//! - [`registry`]: One live store per document key
//! - [`persistence`]: Debounced flushing, retries, eviction
//! - [`workspace`]: Handle tying a document to its persistence
//! - [`config`]: Engine configuration and environment overrides

pub mod config;
pub mod envelope;
pub mod persistence;
pub mod presence;
pub mod registry;
pub mod storage;
pub mod store;
pub mod workspace;

// Re-exports for convenience
pub use config::EngineConfig;
pub use persistence::{PersistError, PersistenceConfig, PersistenceManager, PersistenceStats};
pub use presence::{
    color_for, AwarenessMessage, PresenceConfig, PresenceRoom, PresenceState, DEFAULT_PRESENCE_TIMEOUT,
};
pub use registry::{lock_store, DocumentRegistry, RegistryStats, SharedStore};
pub use storage::{
    DocumentMetadata, DocumentStore, Failure, MemoryStore, SnapshotStore, StoreConfig, StoreError,
};
pub use store::AnnotationStore;
pub use workspace::Workspace;
