//! Debounced, retrying persistence of loaded documents.
//!
//! ```text
//! mark_dirty ──► (re)arm debounce timer ──► flush ──► SnapshotStore
//!                      ▲     │ cancelled              │
//! force_flush ─────────┴─────┘                        │ transient: retry with backoff
//!                                                     │ permanent: degraded
//! evict_idle ──► final flush ──► still clean? ──► DocumentRegistry::remove
//! ```
//!
//! Each key has at most one pending timer and at most one flush in flight.
//! The timer is a spawned task that is aborted and replaced when
//! `mark_dirty` is called again. Flushes for one key serialize on a per-key
//! async lock; a request that arrives during a flush waits for it, then
//! writes again only if the store changed in the meantime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use marginalia_core::DocumentInfo;

use crate::registry::{lock_store, DocumentRegistry};
use crate::storage::{DocumentMetadata, StoreError};
use crate::workspace::Workspace;

/// Default quiet period before a dirty document is written.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Quiet period after the last `mark_dirty` before flushing
    pub debounce: Duration,
    /// First retry delay after a transient failure
    pub retry_base_delay: Duration,
    /// Upper bound for the exponential retry delay
    pub retry_max_delay: Duration,
    /// Retries after the first attempt before giving up
    pub max_retries: u32,
    /// Inactivity before a document with nobody connected is evicted
    pub idle_timeout: Duration,
    /// How often the idle sweeper runs
    pub sweep_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            max_retries: 5,
            idle_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PersistenceConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(80),
            max_retries: 3,
            idle_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Storage kept failing transiently until retries ran out.
    #[error("storage unavailable after retries: {0}")]
    Transient(StoreError),
    #[error("storage failure: {0}")]
    Permanent(StoreError),
    #[error("document not loaded: {0}")]
    NotLoaded(String),
}

impl PersistError {
    /// Classify a storage error without retrying.
    pub fn from_store(e: StoreError) -> Self {
        if e.is_transient() {
            PersistError::Transient(e)
        } else {
            PersistError::Permanent(e)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PersistError::Transient(_))
    }
}

/// Persistence statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    /// Successful snapshot writes
    pub flushes: u64,
    /// Flushes that gave up
    pub failed_flushes: u64,
    /// Retries after transient failures
    pub retries: u64,
    /// Documents unloaded after a final flush
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    retries: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Default)]
struct KeyState {
    timer: Option<JoinHandle<()>>,
    generation: u64,
    last_editor: Option<String>,
    degraded: bool,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

struct Inner {
    registry: Arc<DocumentRegistry>,
    config: PersistenceConfig,
    keys: Mutex<HashMap<String, KeyState>>,
    counters: Counters,
}

/// Schedules and performs durable writes for the documents in a registry.
///
/// Cheap to clone; clones share state. Scheduling calls (`mark_dirty`)
/// must run inside a Tokio runtime.
#[derive(Clone)]
pub struct PersistenceManager {
    inner: Arc<Inner>,
}

impl PersistenceManager {
    pub fn new(registry: Arc<DocumentRegistry>, config: PersistenceConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                keys: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.inner.config
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, KeyState>> {
        self.inner.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open (or rehydrate) a document and return a handle bound to this
    /// manager.
    pub fn open_workspace(&self, key: &str, info: DocumentInfo) -> Result<Workspace, PersistError> {
        let store = self.inner.registry.open(key, info.clone())?;
        self.inner.registry.touch(key);
        Ok(Workspace::new(key, info, store, self.clone()))
    }

    // ─── Scheduling ─────────────────────────────────────────────────

    /// Record unflushed changes and (re)arm the debounce timer.
    ///
    /// Any pending timer for `key` is cancelled, so a burst of calls inside
    /// the debounce window produces a single flush.
    pub fn mark_dirty(&self, key: &str, last_editor: &str) {
        let mut keys = self.keys();
        let state = keys.entry(key.to_string()).or_default();
        state.last_editor = Some(last_editor.to_string());
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let generation = state.generation;
        let weak = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();
        let debounce = self.inner.config.debounce;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // A pending timer does not keep the manager (and its store) alive.
            if let Some(inner) = weak.upgrade() {
                PersistenceManager { inner }.debounce_elapsed(&owned_key, generation).await;
            }
        }));
        drop(keys);

        self.inner.registry.touch(key);
        log::trace!("Scheduled flush of {} in {:?}", key, debounce);
    }

    async fn debounce_elapsed(&self, key: &str, generation: u64) {
        {
            let mut keys = self.keys();
            let Some(state) = keys.get_mut(key) else {
                return;
            };
            if state.generation != generation {
                return;
            }
            // From here on the flush can no longer be aborted by `mark_dirty`.
            state.timer = None;
        }

        if let Err(PersistError::NotLoaded(_)) = self.flush(key).await {
            log::debug!("Debounced flush skipped; {} is no longer loaded", key);
        }
    }

    fn cancel_timer(&self, key: &str) -> bool {
        let mut keys = self.keys();
        let Some(state) = keys.get_mut(key) else {
            return false;
        };
        state.generation += 1;
        match state.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a debounced flush is armed for `key`.
    pub fn has_pending_flush(&self, key: &str) -> bool {
        self.keys().get(key).is_some_and(|state| state.timer.is_some())
    }

    // ─── Flushing ───────────────────────────────────────────────────

    /// Cancel any pending timer and flush now.
    ///
    /// Returns the written metadata, or `None` if nothing needed writing.
    pub async fn force_flush(&self, key: &str) -> Result<Option<DocumentMetadata>, PersistError> {
        if self.cancel_timer(key) {
            log::debug!("Cancelled pending flush of {} for immediate flush", key);
        }
        self.flush(key).await
    }

    /// Flush every loaded document. Errors are logged; returns how many
    /// documents failed.
    pub async fn flush_all(&self) -> usize {
        let mut failures = 0;
        for key in self.inner.registry.keys() {
            if self.force_flush(&key).await.is_err() {
                failures += 1;
            }
        }
        failures
    }

    fn write_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut keys = self.keys();
        Arc::clone(&keys.entry(key.to_string()).or_default().write_lock)
    }

    async fn flush(&self, key: &str) -> Result<Option<DocumentMetadata>, PersistError> {
        let lock = self.write_lock(key);
        let _in_flight = lock.lock().await;
        self.flush_locked(key).await
    }

    /// Write the current state of `key`. The caller holds the key's write
    /// lock.
    async fn flush_locked(&self, key: &str) -> Result<Option<DocumentMetadata>, PersistError> {
        let store = self
            .inner
            .registry
            .get(key)
            .ok_or_else(|| PersistError::NotLoaded(key.to_string()))?;

        let (version, snapshot) = {
            let store = lock_store(&store);
            if !store.is_dirty() {
                return Ok(None);
            }
            (store.version(), Arc::new(store.full_state()))
        };
        let editor = self.keys().get(key).and_then(|state| state.last_editor.clone());

        match self.write_with_retry(key, snapshot, editor).await {
            Ok(meta) => {
                lock_store(&store).mark_persisted(version);
                self.inner.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.set_degraded(key, false);
                log::debug!(
                    "Flushed {} (store version {}, snapshot v{}, {} bytes)",
                    key,
                    version,
                    meta.version,
                    meta.snapshot_size
                );
                Ok(Some(meta))
            }
            Err(e) => {
                self.inner.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.set_degraded(key, true);
                log::error!("Failed to persist {}; serving in-memory state: {}", key, e);
                Err(e)
            }
        }
    }

    async fn write_with_retry(
        &self,
        key: &str,
        snapshot: Arc<Vec<u8>>,
        editor: Option<String>,
    ) -> Result<DocumentMetadata, PersistError> {
        let config = &self.inner.config;
        let mut delay = config.retry_base_delay;
        let mut attempt: u32 = 0;

        loop {
            let backend = Arc::clone(self.inner.registry.backend());
            let owned_key = key.to_string();
            let bytes = Arc::clone(&snapshot);
            let last_editor = editor.clone();
            let result = tokio::task::spawn_blocking(move || {
                backend.save_snapshot(&owned_key, &bytes, last_editor.as_deref())
            })
            .await
            .unwrap_or_else(|e| Err(StoreError::DatabaseError(format!("write task failed: {e}"))));

            let err = match result {
                Ok(meta) => return Ok(meta),
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(PersistError::Permanent(err));
            }
            if attempt >= config.max_retries {
                return Err(PersistError::Transient(err));
            }

            attempt += 1;
            self.inner.counters.retries.fetch_add(1, Ordering::Relaxed);
            self.set_degraded(key, true);
            log::warn!(
                "Transient failure persisting {} (retry {}/{} in {:?}): {}",
                key,
                attempt,
                config.max_retries,
                delay,
                err
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(config.retry_max_delay);
        }
    }

    // ─── Eviction ───────────────────────────────────────────────────

    /// Flush `key` one last time and unload it.
    ///
    /// Returns `Ok(false)` if the document is not loaded or changed again
    /// during the final flush; it stays loaded in that case. A failed flush
    /// is returned as an error and the document also stays loaded.
    pub async fn evict_idle(&self, key: &str) -> Result<bool, PersistError> {
        self.cancel_timer(key);
        let lock = self.write_lock(key);
        let _in_flight = lock.lock().await;

        let Some(store) = self.inner.registry.get(key) else {
            return Ok(false);
        };
        self.flush_locked(key).await?;

        {
            // Unregister while holding the store so no mutation lands on an
            // instance that is already gone from the registry.
            let guard = lock_store(&store);
            if guard.is_dirty() {
                log::debug!("Not evicting {}; changed during final flush", key);
                return Ok(false);
            }
            self.release_key_state(key, &lock);
            self.inner.registry.remove(key);
        }

        self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
        log::info!("Evicted idle document {}", key);
        Ok(true)
    }

    /// Forget per-key state of an evicted document.
    ///
    /// The write lock is shared by every flush of the key, including flushes
    /// of a later reopened instance. The entry is only dropped when nothing
    /// but the map and `held` refer to the lock; otherwise a queued flush
    /// would end up on a different lock than the next one.
    fn release_key_state(&self, key: &str, held: &Arc<tokio::sync::Mutex<()>>) {
        let mut keys = self.keys();
        let Some(state) = keys.get_mut(key) else {
            return;
        };
        let queued = Arc::strong_count(held) > 2;
        if queued || state.timer.is_some() {
            state.last_editor = None;
            state.degraded = false;
        } else {
            keys.remove(key);
        }
    }

    /// Evict every document idle longer than `idle_timeout`. Returns the
    /// evicted keys.
    pub async fn evict_idle_documents(&self) -> Vec<String> {
        let mut evicted = Vec::new();
        for key in self.inner.registry.idle_keys(self.inner.config.idle_timeout) {
            match self.evict_idle(&key).await {
                Ok(true) => evicted.push(key),
                Ok(false) => {}
                Err(e) => log::warn!("Keeping idle document {} loaded: {}", key, e),
            }
        }
        evicted
    }

    /// Run [`evict_idle_documents`](Self::evict_idle_documents) every
    /// `sweep_interval` until the handle is aborted or every clone of the
    /// manager is dropped.
    pub fn spawn_idle_sweeper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let evicted = PersistenceManager { inner }.evict_idle_documents().await;
                if !evicted.is_empty() {
                    log::debug!("Idle sweep evicted {} documents", evicted.len());
                }
            }
        })
    }

    /// Unregister a collaborator; flush immediately when they were the last
    /// one connected. Returns how many remain.
    pub async fn collaborator_left(&self, key: &str, collaborator: &str) -> Result<usize, PersistError> {
        let remaining = self
            .inner
            .registry
            .leave(key, collaborator)
            .ok_or_else(|| PersistError::NotLoaded(key.to_string()))?;
        if remaining == 0 {
            log::debug!("Last collaborator left {}; flushing", key);
            self.force_flush(key).await?;
        }
        Ok(remaining)
    }

    // ─── Status ─────────────────────────────────────────────────────

    /// Whether `key` is loaded with changes not yet written.
    pub fn is_dirty(&self, key: &str) -> bool {
        self.inner
            .registry
            .get(key)
            .is_some_and(|store| lock_store(&store).is_dirty())
    }

    pub fn is_degraded(&self, key: &str) -> bool {
        self.keys().get(key).is_some_and(|state| state.degraded)
    }

    /// Keys whose last flush attempt failed, sorted.
    pub fn degraded(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .keys()
            .iter()
            .filter(|(_, state)| state.degraded)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn set_degraded(&self, key: &str, degraded: bool) {
        let mut keys = self.keys();
        let state = keys.entry(key.to_string()).or_default();
        if state.degraded != degraded {
            state.degraded = degraded;
            if degraded {
                log::info!("Persistence of {} is degraded", key);
            } else {
                log::info!("Persistence of {} recovered", key);
            }
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        let counters = &self.inner.counters;
        PersistenceStats {
            flushes: counters.flushes.load(Ordering::Relaxed),
            failed_flushes: counters.failed_flushes.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}
