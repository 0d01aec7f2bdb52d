//! Per-process document registry.
//!
//! ```text
//! key ──► Entry { store: Arc<Mutex<AnnotationStore>>, collaborators, last_activity }
//!              │
//!              └── rehydrated from SnapshotStore on first open
//! ```
//!
//! Every document key maps to exactly one live [`AnnotationStore`] per
//! process. The first [`open`](DocumentRegistry::open) of a key rebuilds
//! the store from its persisted snapshot; later opens hand out the same
//! shared instance.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use marginalia_core::DocumentInfo;

use crate::persistence::PersistError;
use crate::presence::{PresenceConfig, PresenceRoom};
use crate::storage::{SnapshotStore, StoreError};
use crate::store::AnnotationStore;

/// Store handle shared between a registry entry and its workspaces.
pub type SharedStore = Arc<Mutex<AnnotationStore>>;

/// Lock a shared store. A panic while another holder had it locked leaves
/// the CRDT state intact, so poisoning is ignored.
pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, AnnotationStore> {
    store.lock().unwrap_or_else(|e| e.into_inner())
}

struct Entry {
    store: SharedStore,
    collaborators: HashSet<String>,
    last_activity: Instant,
}

/// Registry statistics.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub loaded_documents: usize,
    pub rehydrated: u64,
    pub created: u64,
    pub connected_collaborators: usize,
}

/// Arena of loaded documents, keyed by document key.
pub struct DocumentRegistry {
    documents: RwLock<HashMap<String, Entry>>,
    backend: Arc<dyn SnapshotStore>,
    presence: PresenceConfig,
    rehydrated: AtomicU64,
    created: AtomicU64,
}

impl DocumentRegistry {
    pub fn new(backend: Arc<dyn SnapshotStore>) -> Self {
        Self::with_presence_config(backend, PresenceConfig::default())
    }

    pub fn with_presence_config(backend: Arc<dyn SnapshotStore>, presence: PresenceConfig) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            backend,
            presence,
            rehydrated: Default::default(),
            created: Default::default(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn SnapshotStore> {
        &self.backend
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.documents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.documents.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a document, loading it on first use.
    ///
    /// The registry stays write-locked while a missing document is
    /// rehydrated, so two concurrent opens of one key never build two
    /// stores. A snapshot that cannot be integrated is a permanent error and
    /// leaves the key unloaded.
    pub fn open(&self, key: &str, info: DocumentInfo) -> Result<SharedStore, PersistError> {
        if let Some(entry) = self.read().get(key) {
            return Ok(Arc::clone(&entry.store));
        }

        let mut documents = self.write();
        if let Some(entry) = documents.get(key) {
            return Ok(Arc::clone(&entry.store));
        }

        let store = self.load(key, info)?;
        let shared = Arc::new(Mutex::new(store));
        documents.insert(
            key.to_string(),
            Entry {
                store: Arc::clone(&shared),
                collaborators: HashSet::new(),
                last_activity: Instant::now(),
            },
        );
        Ok(shared)
    }

    fn load(&self, key: &str, info: DocumentInfo) -> Result<AnnotationStore, PersistError> {
        let room = PresenceRoom::with_config(Uuid::new_v4(), "marginalia", self.presence);
        let snapshot = self.backend.load_snapshot(key).map_err(PersistError::from_store)?;

        let store = match snapshot {
            Some(bytes) => {
                let store = AnnotationStore::from_snapshot(info, &bytes).ok_or_else(|| {
                    log::error!("Snapshot for {} ({} bytes) could not be applied", key, bytes.len());
                    PersistError::Permanent(StoreError::DeserializationError(format!(
                        "snapshot for {key} could not be applied"
                    )))
                })?;
                self.rehydrated.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Rehydrated document {} from storage ({} bytes, {} highlights)",
                    key,
                    bytes.len(),
                    store.highlight_count()
                );
                store
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                log::debug!("Created new document {}", key);
                AnnotationStore::new(info)
            }
        };
        Ok(store.with_presence(room))
    }

    pub fn get(&self, key: &str) -> Option<SharedStore> {
        self.read().get(key).map(|entry| Arc::clone(&entry.store))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Whether `store` is still the instance registered under `key`.
    pub fn is_current(&self, key: &str, store: &SharedStore) -> bool {
        self.read()
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.store, store))
    }

    /// Loaded document keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop a document from memory. Does not flush.
    pub fn remove(&self, key: &str) -> Option<SharedStore> {
        let removed = self.write().remove(key).map(|entry| entry.store);
        if removed.is_some() {
            log::debug!("Unloaded document {}", key);
        }
        removed
    }

    // ─── Collaborators ──────────────────────────────────────────────

    /// Register a connected collaborator. Returns `false` if the document
    /// is not loaded.
    pub fn join(&self, key: &str, collaborator: &str) -> bool {
        let mut documents = self.write();
        let Some(entry) = documents.get_mut(key) else {
            return false;
        };
        if entry.collaborators.insert(collaborator.to_string()) {
            log::debug!("Collaborator {} joined {} ({} connected)", collaborator, key, entry.collaborators.len());
        }
        entry.last_activity = Instant::now();
        true
    }

    /// Unregister a collaborator. Returns how many remain connected, or
    /// `None` if the document is not loaded.
    pub fn leave(&self, key: &str, collaborator: &str) -> Option<usize> {
        let mut documents = self.write();
        let entry = documents.get_mut(key)?;
        if entry.collaborators.remove(collaborator) {
            log::debug!("Collaborator {} left {} ({} connected)", collaborator, key, entry.collaborators.len());
        }
        entry.last_activity = Instant::now();
        Some(entry.collaborators.len())
    }

    pub fn collaborators(&self, key: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .get(key)
            .map(|entry| entry.collaborators.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    // ─── Activity ───────────────────────────────────────────────────

    pub fn touch(&self, key: &str) {
        if let Some(entry) = self.write().get_mut(key) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn last_activity(&self, key: &str) -> Option<Instant> {
        self.read().get(key).map(|entry| entry.last_activity)
    }

    /// Documents with nobody connected and no activity for `timeout`.
    pub fn idle_keys(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, entry)| entry.collaborators.is_empty())
            .filter(|(_, entry)| now.duration_since(entry.last_activity) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> RegistryStats {
        let documents = self.read();
        RegistryStats {
            loaded_documents: documents.len(),
            rehydrated: self.rehydrated.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            connected_collaborators: documents.values().map(|e| e.collaborators.len()).sum(),
        }
    }
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("documents", &self.keys())
            .finish()
    }
}
