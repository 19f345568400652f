//! Backup service
//!
//! Point-in-time bundles referencing the current published (or latest)
//! version of every known item. Manifests are JSON files under
//! `<data_dir>/backups/`, written with tmp+rename so a partial backup is
//! never observable.

use crate::error::{EngineError, Result};
use crate::model::{Backup, BackupItemRef, BackupSource, VersionStatus};
use crate::version_store::VersionStore;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Owns `Backup` records and their on-disk manifests
pub struct BackupService {
    backups_dir: PathBuf,
    store: Arc<VersionStore>,
}

impl BackupService {
    /// Open the backup manifest directory under a data dir
    pub fn open(data_dir: &std::path::Path, store: Arc<VersionStore>) -> Result<Self> {
        let backups_dir = data_dir.join("backups");
        fs::create_dir_all(&backups_dir)?;
        Ok(Self { backups_dir, store })
    }

    fn manifest_path(&self, id: Uuid) -> PathBuf {
        self.backups_dir.join(format!("{}.json", id))
    }

    fn write_manifest(&self, backup: &Backup) -> Result<()> {
        let path = self.manifest_path(backup.id);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(backup)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Snapshot the current published (or latest, when none is published)
    /// version of every known item into a new backup.
    ///
    /// An empty catalog yields a backup with no item refs, not an error.
    pub async fn create_full_backup(&self, label: &str, source: BackupSource) -> Result<Backup> {
        let keys = self.store.list_item_keys().await?;
        let mut item_refs = Vec::with_capacity(keys.len());
        for key in keys {
            let version = match self.store.get_published_version(&key).await {
                Ok(v) => v,
                Err(EngineError::NotFound(_)) => self.store.get_latest_version(&key).await?,
                Err(e) => return Err(e),
            };
            item_refs.push(BackupItemRef {
                key,
                version_id: version.id,
            });
        }

        let backup = Backup {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            label: label.to_string(),
            source,
            item_refs,
        };
        self.write_manifest(&backup)?;

        let version_ids: Vec<_> = backup.item_refs.iter().map(|r| r.version_id).collect();
        self.store
            .mark_backed_up(&version_ids, backup.timestamp)
            .await?;

        tracing::info!(
            "Backup {} ({:?}, {}) captured {} item(s)",
            backup.id,
            label,
            source,
            backup.item_refs.len()
        );
        Ok(backup)
    }

    /// All backups, newest first
    pub async fn get_all_backups(&self) -> Result<Vec<Backup>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.backups_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read_to_string(&path)?;
            match serde_json::from_str::<Backup>(&data) {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    tracing::warn!("Skipping unreadable backup manifest {:?}: {}", path, e);
                }
            }
        }
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }

    /// Look up one backup by id
    pub async fn get_backup_metadata(&self, id: Uuid) -> Result<Backup> {
        let path = self.manifest_path(id);
        if !path.exists() {
            return Err(EngineError::NotFound(format!("Backup {} not found", id)));
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Delete backups older than `max_age_days` whose referenced versions
    /// are all archived (or already evicted) and not referenced by a newer
    /// backup. The most recent backup always survives, so at least one
    /// restore point exists. Returns the deleted backup ids.
    pub async fn cleanup(&self, max_age_days: i64) -> Result<Vec<Uuid>> {
        let backups = self.get_all_backups().await?;
        if backups.len() <= 1 {
            return Ok(Vec::new());
        }
        let threshold = Utc::now() - Duration::days(max_age_days);

        let mut deleted = Vec::new();
        // Newest first; index 0 is always kept
        for (idx, backup) in backups.iter().enumerate().skip(1) {
            if backup.timestamp >= threshold {
                continue;
            }
            let newer_refs: HashSet<_> = backups[..idx]
                .iter()
                .flat_map(|b| b.item_refs.iter().map(|r| r.version_id))
                .collect();
            if backup
                .item_refs
                .iter()
                .any(|r| newer_refs.contains(&r.version_id))
            {
                continue;
            }

            let mut all_archived = true;
            for item_ref in &backup.item_refs {
                match self.store.get_version(item_ref.version_id).await {
                    Ok(v) if v.status == VersionStatus::Archived => {}
                    // Evicted by retention counts as gone
                    Err(EngineError::NotFound(_)) => {}
                    Ok(_) => {
                        all_archived = false;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if !all_archived {
                continue;
            }

            fs::remove_file(self.manifest_path(backup.id))?;
            tracing::info!("Cleanup removed backup {} ({:?})", backup.id, backup.label);
            deleted.push(backup.id);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentType, ItemKey};
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<VersionStore>, BackupService) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VersionStore::open(tmp.path()).unwrap());
        let service = BackupService::open(tmp.path(), store.clone()).unwrap();
        (tmp, store, service)
    }

    #[tokio::test]
    async fn test_empty_catalog_backup() {
        let (_tmp, _store, service) = setup().await;
        let backup = service
            .create_full_backup("nightly", BackupSource::Auto)
            .await
            .unwrap();
        assert!(backup.item_refs.is_empty());
        assert_eq!(backup.label, "nightly");
    }

    #[tokio::test]
    async fn test_backup_prefers_published_version() {
        let (_tmp, store, service) = setup().await;
        let key = ItemKey::new(ContentType::Product, "sku-1");
        let v1 = store
            .create_version(&key, "Product", Bytes::from("one"), vec!["first".into()], "bot")
            .await
            .unwrap();
        store
            .create_version(&key, "Product", Bytes::from("two"), vec!["second".into()], "bot")
            .await
            .unwrap();
        store.set_status(v1.id, VersionStatus::Published).await.unwrap();

        let backup = service
            .create_full_backup("manual", BackupSource::Manual)
            .await
            .unwrap();
        assert_eq!(backup.item_refs.len(), 1);
        assert_eq!(backup.item_refs[0].version_id, v1.id);

        // Included versions get a backup date stamp
        let stamped = store.get_version(v1.id).await.unwrap();
        assert!(stamped.backup_date.is_some());
    }

    #[tokio::test]
    async fn test_backup_falls_back_to_latest() {
        let (_tmp, store, service) = setup().await;
        let key = ItemKey::new(ContentType::Page, "about");
        store
            .create_version(&key, "About", Bytes::from("one"), vec!["first".into()], "bot")
            .await
            .unwrap();
        let v2 = store
            .create_version(&key, "About", Bytes::from("two"), vec!["second".into()], "bot")
            .await
            .unwrap();

        let backup = service
            .create_full_backup("manual", BackupSource::Manual)
            .await
            .unwrap();
        assert_eq!(backup.item_refs[0].version_id, v2.id);
    }

    #[tokio::test]
    async fn test_metadata_roundtrip_and_listing() {
        let (_tmp, _store, service) = setup().await;
        let first = service
            .create_full_backup("first", BackupSource::Test)
            .await
            .unwrap();
        let second = service
            .create_full_backup("second", BackupSource::Test)
            .await
            .unwrap();

        let loaded = service.get_backup_metadata(first.id).await.unwrap();
        assert_eq!(loaded.label, "first");

        let all = service.get_all_backups().await.unwrap();
        assert_eq!(all.len(), 2);
        // Newest first
        assert_eq!(all[0].id, second.id);

        let missing = service.get_backup_metadata(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cleanup_never_deletes_most_recent() {
        let (_tmp, _store, service) = setup().await;
        service
            .create_full_backup("only", BackupSource::Auto)
            .await
            .unwrap();
        // Age threshold of zero days would qualify everything by age
        let deleted = service.cleanup(0).await.unwrap();
        assert!(deleted.is_empty());
        assert_eq!(service.get_all_backups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_old_archived_backups() {
        let (_tmp, store, service) = setup().await;
        let key = ItemKey::new(ContentType::Course, "rust-101");
        let v1 = store
            .create_version(&key, "Course", Bytes::from("one"), vec!["first".into()], "bot")
            .await
            .unwrap();
        let old = service
            .create_full_backup("old", BackupSource::Auto)
            .await
            .unwrap();

        // The old backup's version is archived and superseded
        let v2 = store
            .create_version(&key, "Course", Bytes::from("two"), vec!["second".into()], "bot")
            .await
            .unwrap();
        store.set_status(v1.id, VersionStatus::Archived).await.unwrap();
        store.set_status(v2.id, VersionStatus::Published).await.unwrap();
        service
            .create_full_backup("new", BackupSource::Auto)
            .await
            .unwrap();

        // Backdate the old manifest past the retention window
        let mut aged = service.get_backup_metadata(old.id).await.unwrap();
        aged.timestamp = Utc::now() - Duration::days(90);
        service.write_manifest(&aged).unwrap();

        let deleted = service.cleanup(30).await.unwrap();
        assert_eq!(deleted, vec![old.id]);
        assert!(matches!(
            service.get_backup_metadata(old.id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_spares_backups_with_live_versions() {
        let (_tmp, store, service) = setup().await;
        let key = ItemKey::new(ContentType::Article, "7");
        let v1 = store
            .create_version(&key, "Article", Bytes::from("one"), vec!["first".into()], "bot")
            .await
            .unwrap();
        store.set_status(v1.id, VersionStatus::Published).await.unwrap();

        let old = service
            .create_full_backup("old", BackupSource::Auto)
            .await
            .unwrap();
        // A newer backup exists, but it references the same published version
        service
            .create_full_backup("new", BackupSource::Auto)
            .await
            .unwrap();

        let mut aged = service.get_backup_metadata(old.id).await.unwrap();
        aged.timestamp = Utc::now() - Duration::days(90);
        service.write_manifest(&aged).unwrap();

        // Still referenced by the newer backup and still published
        let deleted = service.cleanup(30).await.unwrap();
        assert!(deleted.is_empty());
    }
}
