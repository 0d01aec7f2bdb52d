//! In-memory snapshot store.
//!
//! Used for tests and ephemeral engines. Failures can be injected to
//! exercise the retry and degraded paths of the persistence manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use super::{DocumentMetadata, SnapshotStore, StoreError};

/// Kind of failure to inject into saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Permanent,
}

impl Failure {
    fn to_error(self) -> StoreError {
        match self {
            Failure::Transient => StoreError::Unavailable("injected transient failure".into()),
            Failure::Permanent => StoreError::DatabaseError("injected permanent failure".into()),
        }
    }
}

#[derive(Debug, Default)]
struct FailurePlan {
    remaining: usize,
    failure: Option<Failure>,
}

/// Snapshot store kept in a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, (Vec<u8>, DocumentMetadata)>>,
    plan: Mutex<FailurePlan>,
    writes: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` saves with `failure`.
    pub fn fail_next_saves(&self, count: usize, failure: Failure) {
        let mut plan = self.plan.lock().unwrap_or_else(|e| e.into_inner());
        plan.remaining = count;
        plan.failure = Some(failure);
    }

    /// Fail every save until [`clear_failures`](Self::clear_failures).
    pub fn fail_all_saves(&self, failure: Failure) {
        self.fail_next_saves(usize::MAX, failure);
    }

    pub fn clear_failures(&self) {
        let mut plan = self.plan.lock().unwrap_or_else(|e| e.into_inner());
        *plan = FailurePlan::default();
    }

    /// Successful snapshot writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Save attempts, including injected failures.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Option<StoreError> {
        let mut plan = self.plan.lock().unwrap_or_else(|e| e.into_inner());
        let failure = plan.failure?;
        if plan.remaining == 0 {
            plan.failure = None;
            return None;
        }
        if plan.remaining != usize::MAX {
            plan.remaining -= 1;
        }
        Some(failure.to_error())
    }

    fn lock_error<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::DatabaseError(format!("Lock error: {e}"))
    }
}

impl SnapshotStore for MemoryStore {
    fn save_snapshot(
        &self,
        key: &str,
        snapshot: &[u8],
        last_editor: Option<&str>,
    ) -> Result<DocumentMetadata, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }

        let mut docs = self.documents.write().map_err(Self::lock_error)?;
        let mut meta = docs
            .get(key)
            .map(|(_, meta)| meta.clone())
            .unwrap_or_else(|| DocumentMetadata::new(key));
        meta.bump(snapshot.len(), snapshot.len(), last_editor);
        docs.insert(key.to_string(), (snapshot.to_vec(), meta.clone()));

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(meta)
    }

    fn load_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let docs = self.documents.read().map_err(Self::lock_error)?;
        Ok(docs.get(key).map(|(bytes, _)| bytes.clone()))
    }

    fn load_metadata(&self, key: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let docs = self.documents.read().map_err(Self::lock_error)?;
        Ok(docs.get(key).map(|(_, meta)| meta.clone()))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut docs = self.documents.write().map_err(Self::lock_error)?;
        docs.remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let docs = self.documents.read().map_err(Self::lock_error)?;
        Ok(docs.keys().cloned().collect())
    }
}
