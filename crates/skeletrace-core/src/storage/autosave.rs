//! Periodic persistence of a shared skeleton.

use crate::nml::{LoadMode, LoadSummary};
use crate::protocol::SharedSkeleton;
use crate::storage::{FileStorage, Storage, StorageError, StorageResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default auto-save interval in seconds.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// Key under which the ID of the most recently saved annotation is kept.
pub const LAST_ANNOTATION_KEY: &str = "__last_annotation__";

/// Saves a [`SharedSkeleton`] to a storage backend once it has unsaved
/// changes and the interval has elapsed.
pub struct AutoSaveManager<S: Storage> {
    storage: Arc<S>,
    interval: Duration,
    last_save: Option<Instant>,
    /// Annotation being edited; assigned on first save if unset.
    current_id: Option<String>,
}

impl<S: Storage> AutoSaveManager<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
            last_save: None,
            current_id: None,
        }
    }

    /// Manager using the interval from the store's configuration.
    pub fn for_skeleton(storage: Arc<S>, skeleton: &SharedSkeleton) -> StorageResult<Self> {
        let interval = skeleton.with_read(|s| s.config().autosave_interval())?;
        let mut manager = Self::new(storage);
        manager.set_interval(interval);
        Ok(manager)
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_document_id(&mut self, id: Option<String>) {
        self.current_id = id;
    }

    pub fn document_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    /// Whether the store is dirty and the interval has passed since the last save.
    pub fn should_save(&self, skeleton: &SharedSkeleton) -> StorageResult<bool> {
        if !skeleton.with_read(|s| s.has_unsaved_changes())? {
            return Ok(false);
        }
        Ok(self
            .last_save
            .is_none_or(|last| last.elapsed() >= self.interval))
    }

    /// Save if needed. Returns true if a save was performed.
    pub async fn maybe_save(&mut self, skeleton: &SharedSkeleton) -> StorageResult<bool> {
        if !self.should_save(skeleton)? {
            return Ok(false);
        }
        self.save(skeleton).await?;
        Ok(true)
    }

    /// Save immediately.
    ///
    /// The unsaved flag is cleared only if nothing changed while the
    /// document was being written.
    pub async fn save(&mut self, skeleton: &SharedSkeleton) -> StorageResult<()> {
        let id = self
            .current_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let (nml, revision) = skeleton.with_read(|s| (s.to_nml(), s.revision()))?;

        self.storage.save(&id, &nml).await?;
        self.storage.save(LAST_ANNOTATION_KEY, &id).await?;

        let clean = skeleton.with_locked(|s| {
            let unchanged = s.revision() == revision;
            if unchanged {
                s.mark_saved();
            }
            unchanged
        })?;
        if !clean {
            log::debug!("Skeleton changed during save of {}; still dirty", id);
        }
        log::info!("Saved annotation {} at revision {}", id, revision);
        self.last_save = Some(Instant::now());
        Ok(())
    }

    /// Replace the store's contents with a saved annotation.
    pub async fn load(&mut self, id: &str, skeleton: &SharedSkeleton) -> StorageResult<LoadSummary> {
        let nml = self.storage.load(id).await?;
        let summary = skeleton.load_nml(&nml, LoadMode::Replace)?;
        skeleton.with_locked(|s| s.mark_saved())?;
        self.current_id = Some(id.to_string());
        self.last_save = Some(Instant::now());
        log::info!("Loaded annotation {} ({} nodes)", id, summary.nodes);
        Ok(summary)
    }

    /// Load the most recently saved annotation, if there is one.
    pub async fn load_last(&mut self, skeleton: &SharedSkeleton) -> StorageResult<Option<LoadSummary>> {
        let id = match self.storage.load(LAST_ANNOTATION_KEY).await {
            Ok(id) => id,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        self.load(&id, skeleton).await.map(Some)
    }

    pub async fn delete(&self, id: &str) -> StorageResult<()> {
        self.storage.delete(id).await
    }

    /// List saved annotation IDs.
    pub async fn list_documents(&self) -> StorageResult<Vec<String>> {
        let mut ids = self.storage.list().await?;
        ids.retain(|id| id != LAST_ANNOTATION_KEY);
        Ok(ids)
    }

    pub async fn exists(&self, id: &str) -> StorageResult<bool> {
        self.storage.exists(id).await
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}

/// Auto-save manager over the default on-disk location.
pub fn create_autosave_manager(skeleton: &SharedSkeleton) -> StorageResult<AutoSaveManager<FileStorage>> {
    let storage = Arc::new(FileStorage::default_location()?);
    AutoSaveManager::for_skeleton(storage, skeleton)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SkeletonConfig;
    use crate::mutation::Mutation;
    use crate::storage::{MemoryStorage, block_on};

    fn skeleton_with_tree() -> SharedSkeleton {
        let skeleton = SharedSkeleton::new(SkeletonConfig::default());
        skeleton.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        skeleton
    }

    #[test]
    fn test_clean_store_is_not_saved() {
        let manager = AutoSaveManager::new(Arc::new(MemoryStorage::new()));
        let skeleton = SharedSkeleton::new(SkeletonConfig::default());
        assert!(!manager.should_save(&skeleton).unwrap());
    }

    #[test]
    fn test_interval_from_config() {
        let config = SkeletonConfig {
            autosave_interval_secs: 5,
            ..SkeletonConfig::default()
        };
        let skeleton = SharedSkeleton::new(config);
        let manager = AutoSaveManager::for_skeleton(Arc::new(MemoryStorage::new()), &skeleton).unwrap();
        assert_eq!(manager.interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_save_clears_unsaved_flag() {
        let mut manager = AutoSaveManager::new(Arc::new(MemoryStorage::new()));
        let skeleton = skeleton_with_tree();
        assert!(manager.should_save(&skeleton).unwrap());

        assert!(block_on(manager.maybe_save(&skeleton)).unwrap());
        assert!(!skeleton.with_read(|s| s.has_unsaved_changes()).unwrap());
        assert!(manager.document_id().is_some());
    }

    #[test]
    fn test_interval_gates_second_save() {
        let mut manager = AutoSaveManager::new(Arc::new(MemoryStorage::new()));
        manager.set_interval(Duration::from_secs(3600));
        let skeleton = skeleton_with_tree();
        block_on(manager.save(&skeleton)).unwrap();

        skeleton.submit(Mutation::AddTree { id: 0, color: None }).unwrap();
        assert!(!block_on(manager.maybe_save(&skeleton)).unwrap());
    }

    #[test]
    fn test_load_last_restores_annotation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path().to_path_buf()).unwrap());
        let mut manager = AutoSaveManager::new(storage.clone());
        manager.set_document_id(Some("cell-9".into()));
        let skeleton = skeleton_with_tree();
        block_on(manager.save(&skeleton)).unwrap();

        let mut restored = AutoSaveManager::new(storage);
        let fresh = SharedSkeleton::new(SkeletonConfig::default());
        let summary = block_on(restored.load_last(&fresh)).unwrap().unwrap();
        assert_eq!(summary.trees, 1);
        assert_eq!(restored.document_id(), Some("cell-9"));
        assert!(!fresh.with_read(|s| s.has_unsaved_changes()).unwrap());
    }

    #[test]
    fn test_load_last_without_history() {
        let mut manager = AutoSaveManager::new(Arc::new(MemoryStorage::new()));
        let skeleton = SharedSkeleton::new(SkeletonConfig::default());
        assert!(block_on(manager.load_last(&skeleton)).unwrap().is_none());
    }

    #[test]
    fn test_list_excludes_pointer_key() {
        let mut manager = AutoSaveManager::new(Arc::new(MemoryStorage::new()));
        let skeleton = skeleton_with_tree();
        block_on(manager.save(&skeleton)).unwrap();

        let list = block_on(manager.list_documents()).unwrap();
        assert_eq!(list.len(), 1);
        assert!(!list.contains(&LAST_ANNOTATION_KEY.to_string()));
    }
}
