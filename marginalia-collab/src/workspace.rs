//! Handle binding one loaded document to its persistence manager.

use marginalia_core::{split, DocumentInfo, Region, RegionResolver, SplitRegion};

use crate::persistence::{PersistError, PersistenceManager};
use crate::registry::{lock_store, SharedStore};
use crate::storage::DocumentMetadata;
use crate::store::AnnotationStore;

/// A document key, its live store and the manager that persists it.
///
/// Mutations go through [`mutate`](Self::mutate) so every change schedules
/// a flush. If the document was evicted since the handle was created, the
/// next access rehydrates it from storage.
#[derive(Debug, Clone)]
pub struct Workspace {
    key: String,
    info: DocumentInfo,
    store: SharedStore,
    persistence: PersistenceManager,
}

impl Workspace {
    pub(crate) fn new(key: &str, info: DocumentInfo, store: SharedStore, persistence: PersistenceManager) -> Self {
        Self {
            key: key.to_string(),
            info,
            store,
            persistence,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The store instance captured when the handle was opened. After an
    /// eviction this is no longer the registered one.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    /// Run `f` against the registered store, reopening it if the handle's
    /// instance has been evicted. `f` runs with the store locked.
    fn with_current<R>(&self, f: impl FnOnce(&mut AnnotationStore) -> R) -> Result<R, PersistError> {
        let registry = self.persistence.registry();
        let mut store = self.store.clone();
        loop {
            let mut guard = lock_store(&store);
            if registry.is_current(&self.key, &store) {
                return Ok(f(&mut guard));
            }
            drop(guard);
            log::debug!("Workspace {} was evicted; reopening", self.key);
            store = registry.open(&self.key, self.info.clone())?;
        }
    }

    /// Apply a local mutation and schedule a flush if it changed anything.
    ///
    /// Must run inside a Tokio runtime.
    pub fn mutate<R>(&self, editor: &str, f: impl FnOnce(&mut AnnotationStore) -> R) -> Result<R, PersistError> {
        let (out, changed) = self.with_current(|store| {
            let before = store.version();
            let out = f(store);
            (out, store.version() != before)
        })?;
        if changed {
            self.persistence.mark_dirty(&self.key, editor);
        }
        Ok(out)
    }

    /// Merge an update from another replica. Only an update that changed
    /// the store marks the document dirty; redelivered updates do not.
    pub fn apply_remote(&self, bytes: &[u8], editor: &str) -> Result<bool, PersistError> {
        let (applied, changed) = self.with_current(|store| {
            let before = store.version();
            let applied = store.apply_update(bytes);
            (applied, store.version() != before)
        })?;
        if changed {
            self.persistence.mark_dirty(&self.key, editor);
        }
        Ok(applied)
    }

    /// Read from the store without scheduling anything.
    pub fn read<R>(&self, f: impl FnOnce(&AnnotationStore) -> R) -> Result<R, PersistError> {
        self.with_current(|store| f(store))
    }

    /// Resolve the current highlights into regions.
    pub fn regions(&self, resolver: &RegionResolver) -> Result<Vec<Region>, PersistError> {
        let spans = self.read(|store| store.spans())?;
        Ok(resolver.resolve(&spans))
    }

    /// Regions cut at `boundaries`, ready for marker export.
    pub fn split_regions(
        &self,
        resolver: &RegionResolver,
        boundaries: &[usize],
    ) -> Result<Vec<SplitRegion>, PersistError> {
        Ok(split(&self.regions(resolver)?, boundaries))
    }

    /// Flush now, bypassing the debounce timer.
    pub async fn flush(&self) -> Result<Option<DocumentMetadata>, PersistError> {
        self.persistence.force_flush(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PersistenceConfig;
    use crate::registry::DocumentRegistry;
    use crate::storage::MemoryStore;
    use marginalia_core::{HighlightMetadata, StackClass};
    use std::sync::Arc;

    fn manager() -> (Arc<MemoryStore>, PersistenceManager) {
        let backend = Arc::new(MemoryStore::new());
        let registry = Arc::new(DocumentRegistry::new(backend.clone()));
        (backend, PersistenceManager::new(registry, PersistenceConfig::for_testing()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_does_not_mark_dirty() {
        let (_backend, manager) = manager();
        let ws = manager.open_workspace("doc", DocumentInfo::new(20)).unwrap();

        let result = ws
            .mutate("ada", |store| {
                store.add_highlight(5..50, None, "ada", HighlightMetadata::default())
            })
            .unwrap();
        assert!(result.is_err());
        assert!(!manager.has_pending_flush("doc"));

        let removed = ws.mutate("ada", |store| store.remove_highlight("missing")).unwrap();
        assert!(!removed);
        assert!(!manager.is_dirty("doc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_remote_marks_dirty_only_when_applied() {
        let (_backend, manager) = manager();
        let ws = manager.open_workspace("doc", DocumentInfo::new(20)).unwrap();

        assert!(!ws.apply_remote(&[0xFF, 0xFF], "grace").unwrap());
        assert!(!manager.has_pending_flush("doc"));

        let mut remote = AnnotationStore::new(DocumentInfo::new(20));
        remote
            .add_highlight(0..4, None, "grace", HighlightMetadata::default())
            .unwrap();
        assert!(ws.apply_remote(&remote.full_state(), "grace").unwrap());
        assert!(manager.has_pending_flush("doc"));
        assert!(manager.is_dirty("doc"));

        ws.flush().await.unwrap();
        assert!(ws.apply_remote(&remote.full_state(), "grace").unwrap());
        assert!(!manager.has_pending_flush("doc"));
        assert!(!manager.is_dirty("doc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_handle_reopens() {
        let (_backend, manager) = manager();
        let ws = manager.open_workspace("doc", DocumentInfo::new(20)).unwrap();
        ws.mutate("ada", |store| {
            store.add_highlight(0..4, None, "ada", HighlightMetadata::default())
        })
        .unwrap()
        .unwrap();
        assert!(manager.evict_idle("doc").await.unwrap());

        ws.mutate("ada", |store| {
            store.add_highlight(6..9, None, "ada", HighlightMetadata::default())
        })
        .unwrap()
        .unwrap();
        assert!(manager.registry().contains("doc"));
        assert_eq!(ws.read(|store| store.highlight_count()).unwrap(), 2);
        assert!(manager.is_dirty("doc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_split_regions() {
        let (_backend, manager) = manager();
        let ws = manager.open_workspace("doc", DocumentInfo::new(20)).unwrap();
        for range in [0..10, 5..15] {
            ws.mutate("ada", |store| {
                store.add_highlight(range, None, "ada", HighlightMetadata::default())
            })
            .unwrap()
            .unwrap();
        }

        let resolver = RegionResolver::default();
        let regions = ws.regions(&resolver).unwrap();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[1].stack_class, StackClass::Stacked);

        let pieces = ws.split_regions(&resolver, &[12]).unwrap();
        assert_eq!(pieces.len(), 4);
        assert_eq!((pieces[2].start, pieces[2].end), (10, 12));
    }
}
