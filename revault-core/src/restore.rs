//! Restore manager
//!
//! Validates and executes restoration of a single version or a whole
//! backup. Restores are partial-failure-tolerant: every item gets its own
//! result, and a failed outbound notification rolls the item's status flip
//! back so the store never ends up published-but-unadopted.

use crate::backup::BackupService;
use crate::error::{EngineError, Result};
use crate::model::{
    BackupItemRef, BackupSource, ContentVersion, ItemKey, VersionId, VersionStatus,
};
use crate::protection::ProtectionRegistry;
use crate::version_store::VersionStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Outbound seam to the authoritative content store.
///
/// `adopt` must acknowledge the restored payload; a failure rolls the
/// restore of that item back.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn adopt(&self, key: &ItemKey, payload: Bytes) -> Result<()>;
}

/// Cooperative cancellation flag checked between restore items
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What to restore
#[derive(Debug, Clone, Copy)]
pub enum RestoreTarget {
    Version(VersionId),
    Backup(Uuid),
}

/// Restore behavior switches
#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Take one automatic safety backup before the first item is applied
    pub create_backup_before_restore: bool,
    /// Plan only; executing a dry-run plan is refused
    pub dry_run: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            create_backup_before_restore: true,
            dry_run: false,
        }
    }
}

/// A protection conflict discovered while planning
#[derive(Debug, Clone)]
pub struct RestoreConflict {
    pub item: BackupItemRef,
    pub reason: String,
}

/// Resolved list of items to restore, with conflicts reported (not thrown)
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub entries: Vec<BackupItemRef>,
    pub conflicts: Vec<RestoreConflict>,
    pub options: RestoreOptions,
}

impl RestorePlan {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Per-item restore failure
#[derive(Debug)]
pub struct RestoreFailure {
    pub item: BackupItemRef,
    pub error: EngineError,
}

/// Per-item results of an executed restore
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<ContentVersion>,
    pub errors: Vec<RestoreFailure>,
}

impl RestoreReport {
    /// Overall success: at least one item restored, or nothing failed
    pub fn success(&self) -> bool {
        !self.restored.is_empty() || self.errors.is_empty()
    }
}

/// Validates and executes restore plans
pub struct RestoreManager {
    store: Arc<VersionStore>,
    backups: Arc<BackupService>,
    protection: Arc<ProtectionRegistry>,
    content_store: Arc<dyn ContentStore>,
}

impl RestoreManager {
    pub fn new(
        store: Arc<VersionStore>,
        backups: Arc<BackupService>,
        protection: Arc<ProtectionRegistry>,
        content_store: Arc<dyn ContentStore>,
    ) -> Self {
        Self {
            store,
            backups,
            protection,
            content_store,
        }
    }

    /// Resolve a target into a concrete plan without applying anything.
    ///
    /// Protection conflicts are collected so the caller can decide whether
    /// to proceed with approval; an unknown target is `NotFound`.
    pub async fn prepare_restore(
        &self,
        target: RestoreTarget,
        options: RestoreOptions,
    ) -> Result<RestorePlan> {
        let entries = match target {
            RestoreTarget::Version(id) => {
                let version = self.store.get_version(id).await?;
                vec![BackupItemRef {
                    key: version.key,
                    version_id: id,
                }]
            }
            RestoreTarget::Backup(id) => self.backups.get_backup_metadata(id).await?.item_refs,
        };

        let mut conflicts = Vec::new();
        for entry in &entries {
            // Restore is a mutating operation, so it answers to the same rule
            let check = self
                .protection
                .check_operation(&entry.key, "restore", false)
                .await;
            if !check.allowed {
                conflicts.push(RestoreConflict {
                    item: entry.clone(),
                    reason: check
                        .reason
                        .unwrap_or_else(|| format!("{} is protected", entry.key)),
                });
            }
        }

        Ok(RestorePlan {
            entries,
            conflicts,
            options,
        })
    }

    /// Execute a plan. See [`RestoreManager::execute_restore_with_cancel`].
    pub async fn execute_restore(&self, plan: &RestorePlan, approved: bool) -> Result<RestoreReport> {
        self.execute_restore_with_cancel(plan, approved, &CancelFlag::new())
            .await
    }

    /// Execute a plan item by item.
    ///
    /// Protected items without approval are skipped with a
    /// `PermissionDenied` entry; a multi-item restore is never
    /// all-or-nothing. Once cancelled, already-applied items stay applied
    /// and the remainder is reported as `Cancelled`.
    pub async fn execute_restore_with_cancel(
        &self,
        plan: &RestorePlan,
        approved: bool,
        cancel: &CancelFlag,
    ) -> Result<RestoreReport> {
        if plan.options.dry_run {
            return Err(EngineError::RestoreConflict(
                "Plan was prepared as a dry run; prepare again without dry_run to execute".into(),
            ));
        }

        let mut report = RestoreReport::default();
        let mut safety_taken = false;

        for entry in &plan.entries {
            if cancel.is_cancelled() {
                report.errors.push(RestoreFailure {
                    item: entry.clone(),
                    error: EngineError::Cancelled(format!("Restore of {} cancelled", entry.key)),
                });
                continue;
            }

            let check = self
                .protection
                .check_operation(&entry.key, "restore", approved)
                .await;
            if !check.allowed {
                report.errors.push(RestoreFailure {
                    item: entry.clone(),
                    error: EngineError::PermissionDenied(
                        check
                            .reason
                            .unwrap_or_else(|| format!("{} is protected", entry.key)),
                    ),
                });
                continue;
            }

            // One safety backup before the first applied item
            if plan.options.create_backup_before_restore && !safety_taken {
                self.backups
                    .create_full_backup("pre-restore safety snapshot", BackupSource::Auto)
                    .await?;
                safety_taken = true;
            }

            match self.restore_item(entry).await {
                Ok(version) => report.restored.push(version),
                Err(error) => report.errors.push(RestoreFailure {
                    item: entry.clone(),
                    error,
                }),
            }
        }

        tracing::info!(
            "Restore applied {} item(s), {} failed",
            report.restored.len(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Promote one version to published and hand its payload to the
    /// content store; roll the promotion back if the hand-off fails.
    async fn restore_item(&self, entry: &BackupItemRef) -> Result<ContentVersion> {
        let target = self.store.get_version(entry.version_id).await?;
        let prior_status = target.status;
        let prior_published = match self.store.get_published_version(&entry.key).await {
            Ok(v) => Some(v),
            Err(EngineError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let promoted = self
            .store
            .set_status(entry.version_id, VersionStatus::Published)
            .await?;

        match self
            .content_store
            .adopt(&entry.key, promoted.content.clone())
            .await
        {
            Ok(()) => Ok(promoted),
            Err(adopt_err) => {
                tracing::warn!(
                    "Content store refused restored payload for {}, rolling back: {}",
                    entry.key,
                    adopt_err
                );
                self.rollback_item(entry, prior_status, prior_published.as_ref())
                    .await?;
                Err(adopt_err)
            }
        }
    }

    async fn rollback_item(
        &self,
        entry: &BackupItemRef,
        prior_status: VersionStatus,
        prior_published: Option<&ContentVersion>,
    ) -> Result<()> {
        match prior_published {
            Some(prev) if prev.id != entry.version_id => {
                // Re-promoting the previous version demotes the target
                self.store.set_status(prev.id, VersionStatus::Published).await?;
                if prior_status != VersionStatus::Archived {
                    self.store.set_status(entry.version_id, prior_status).await?;
                }
            }
            Some(_) => {
                // Target was already published; nothing to undo
            }
            None => {
                if prior_status != VersionStatus::Published {
                    self.store.set_status(entry.version_id, prior_status).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentType;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    /// Content store double that records adoptions and can fail per key
    #[derive(Default)]
    struct RecordingContentStore {
        adopted: Mutex<Vec<(ItemKey, Bytes)>>,
        fail_for: Mutex<Option<ItemKey>>,
    }

    #[async_trait]
    impl ContentStore for RecordingContentStore {
        async fn adopt(&self, key: &ItemKey, payload: Bytes) -> Result<()> {
            if self.fail_for.lock().await.as_ref() == Some(key) {
                return Err(EngineError::Storage(format!(
                    "Content store rejected payload for {}",
                    key
                )));
            }
            self.adopted.lock().await.push((key.clone(), payload));
            Ok(())
        }
    }

    struct Harness {
        _tmp: TempDir,
        store: Arc<VersionStore>,
        backups: Arc<BackupService>,
        protection: Arc<ProtectionRegistry>,
        content: Arc<RecordingContentStore>,
        manager: RestoreManager,
    }

    async fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VersionStore::open(tmp.path()).unwrap());
        let backups = Arc::new(BackupService::open(tmp.path(), store.clone()).unwrap());
        let protection = Arc::new(ProtectionRegistry::open(tmp.path()).unwrap());
        protection.set_enforcement(true);
        let content = Arc::new(RecordingContentStore::default());
        let manager = RestoreManager::new(
            store.clone(),
            backups.clone(),
            protection.clone(),
            content.clone(),
        );
        Harness {
            _tmp: tmp,
            store,
            backups,
            protection,
            content,
            manager,
        }
    }

    async fn seed(h: &Harness, key: &ItemKey, payloads: &[&str]) -> Vec<ContentVersion> {
        let mut versions = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let v = h
                .store
                .create_version(
                    key,
                    "Item",
                    Bytes::from(payload.to_string()),
                    vec![format!("edit {}", i + 1)],
                    "alice",
                )
                .await
                .unwrap();
            versions.push(v);
        }
        // Latest becomes the published baseline
        let last = versions.last().unwrap().id;
        h.store.set_status(last, VersionStatus::Published).await.unwrap();
        versions
    }

    #[tokio::test]
    async fn test_restore_single_version() {
        let h = harness().await;
        let key = ItemKey::new(ContentType::Article, "2");
        let versions = seed(&h, &key, &["one", "two"]).await;

        let plan = h
            .manager
            .prepare_restore(
                RestoreTarget::Version(versions[0].id),
                RestoreOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert!(!plan.has_conflicts());

        let report = h.manager.execute_restore(&plan, true).await.unwrap();
        assert!(report.success());
        assert_eq!(report.restored.len(), 1);

        let published = h.store.get_published_version(&key).await.unwrap();
        assert_eq!(published.id, versions[0].id);
        assert_eq!(published.content.as_ref(), b"one");

        // Content store adopted the restored payload
        let adopted = h.content.adopted.lock().await;
        assert_eq!(adopted.len(), 1);
        assert_eq!(adopted[0].1.as_ref(), b"one");

        // A safety backup was taken
        assert_eq!(h.backups.get_all_backups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_plan_refuses_execution() {
        let h = harness().await;
        let key = ItemKey::new(ContentType::Page, "home");
        let versions = seed(&h, &key, &["one"]).await;

        let plan = h
            .manager
            .prepare_restore(
                RestoreTarget::Version(versions[0].id),
                RestoreOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = h.manager.execute_restore(&plan, true).await.unwrap_err();
        assert!(matches!(err, EngineError::RestoreConflict(_)));
    }

    #[tokio::test]
    async fn test_unknown_target_is_not_found() {
        let h = harness().await;
        let key = ItemKey::new(ContentType::Page, "ghost");
        let missing = VersionId::derive(&key, 99);
        let err = h
            .manager
            .prepare_restore(RestoreTarget::Version(missing), RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let err = h
            .manager
            .prepare_restore(RestoreTarget::Backup(Uuid::new_v4()), RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_protected_item_reported_as_conflict_and_skipped() {
        let h = harness().await;
        let protected_key = ItemKey::new(ContentType::Article, "2");
        let open_key_a = ItemKey::new(ContentType::Page, "home");
        let open_key_b = ItemKey::new(ContentType::Product, "sku-1");
        seed(&h, &protected_key, &["p1"]).await;
        seed(&h, &open_key_a, &["a1"]).await;
        seed(&h, &open_key_b, &["b1"]).await;
        h.protection
            .add_rule(protected_key.clone(), "Article", "original research article")
            .await
            .unwrap();

        let backup = h
            .backups
            .create_full_backup("pre-test", BackupSource::Test)
            .await
            .unwrap();
        assert_eq!(backup.item_refs.len(), 3);

        let plan = h
            .manager
            .prepare_restore(RestoreTarget::Backup(backup.id), RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].item.key, protected_key);

        // Executing without approval: 2 restored, 1 PermissionDenied
        let report = h.manager.execute_restore(&plan, false).await.unwrap();
        assert!(report.success());
        assert_eq!(report.restored.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            report.errors[0].error,
            EngineError::PermissionDenied(_)
        ));
        assert_eq!(report.errors[0].item.key, protected_key);
    }

    #[tokio::test]
    async fn test_adopt_failure_rolls_back_status() {
        let h = harness().await;
        let key = ItemKey::new(ContentType::Course, "rust-101");
        let versions = seed(&h, &key, &["one", "two"]).await;
        *h.content.fail_for.lock().await = Some(key.clone());

        let plan = h
            .manager
            .prepare_restore(
                RestoreTarget::Version(versions[0].id),
                RestoreOptions {
                    create_backup_before_restore: false,
                    dry_run: false,
                },
            )
            .await
            .unwrap();
        let report = h.manager.execute_restore(&plan, true).await.unwrap();
        assert!(report.restored.is_empty());
        assert_eq!(report.errors.len(), 1);

        // The previously published version is authoritative again,
        // and there is still exactly one published version.
        let published = h.store.get_published_version(&key).await.unwrap();
        assert_eq!(published.id, versions[1].id);
        let target = h.store.get_version(versions[0].id).await.unwrap();
        assert_ne!(target.status, VersionStatus::Published);
    }

    #[tokio::test]
    async fn test_backup_restore_roundtrip_is_idempotent() {
        let h = harness().await;
        let key_a = ItemKey::new(ContentType::Article, "1");
        let key_b = ItemKey::new(ContentType::Page, "home");
        seed(&h, &key_a, &["a-one"]).await;
        seed(&h, &key_b, &["b-one"]).await;

        let backup = h
            .backups
            .create_full_backup("checkpoint", BackupSource::Manual)
            .await
            .unwrap();

        // Later edits supersede the captured state
        let newer = h
            .store
            .create_version(&key_a, "Item", Bytes::from("a-two"), vec!["edit".into()], "bob")
            .await
            .unwrap();
        h.store.set_status(newer.id, VersionStatus::Published).await.unwrap();

        for _ in 0..2 {
            let plan = h
                .manager
                .prepare_restore(RestoreTarget::Backup(backup.id), RestoreOptions::default())
                .await
                .unwrap();
            let report = h.manager.execute_restore(&plan, true).await.unwrap();
            assert!(report.success());
            assert_eq!(report.errors.len(), 0);

            let published_a = h.store.get_published_version(&key_a).await.unwrap();
            assert_eq!(published_a.content.as_ref(), b"a-one");
            let published_b = h.store.get_published_version(&key_b).await.unwrap();
            assert_eq!(published_b.content.as_ref(), b"b-one");
        }
    }

    #[tokio::test]
    async fn test_cancellation_reports_remaining_items() {
        let h = harness().await;
        let key_a = ItemKey::new(ContentType::Article, "1");
        let key_b = ItemKey::new(ContentType::Page, "home");
        seed(&h, &key_a, &["a-one"]).await;
        seed(&h, &key_b, &["b-one"]).await;

        let backup = h
            .backups
            .create_full_backup("checkpoint", BackupSource::Test)
            .await
            .unwrap();
        let plan = h
            .manager
            .prepare_restore(RestoreTarget::Backup(backup.id), RestoreOptions::default())
            .await
            .unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = h
            .manager
            .execute_restore_with_cancel(&plan, true, &cancel)
            .await
            .unwrap();
        assert!(report.restored.is_empty());
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .all(|e| matches!(e.error, EngineError::Cancelled(_))));
    }
}
