//! Revision manager
//!
//! Sole consumer of change notifications and the only component that
//! creates versions. Protected items that change without approval are
//! refused and flagged with a warning instead of being versioned.

use crate::error::{EngineError, Result};
use crate::model::{ChangeEvent, ContentVersion, ItemKey, Warning, WarningKind};
use crate::protection::ProtectionRegistry;
use crate::version_store::VersionStore;
use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Summarize what changed between two payload snapshots.
///
/// Always yields at least one entry.
pub fn diff_summary(previous: Option<&Bytes>, current: &Bytes) -> Vec<String> {
    match previous {
        None => vec!["Initial version".to_string()],
        Some(prev) if prev == current => vec!["No payload change detected".to_string()],
        Some(prev) => {
            let mut changes = vec![format!(
                "Content updated ({} -> {} bytes)",
                prev.len(),
                current.len()
            )];
            if prev.len() != current.len() {
                let delta = current.len() as i64 - prev.len() as i64;
                changes.push(format!("Size changed by {} bytes", delta));
            }
            changes
        }
    }
}

/// Observes content mutations and records them as versions
pub struct RevisionManager {
    store: Arc<VersionStore>,
    protection: Arc<ProtectionRegistry>,
    max_versions_per_item: usize,
    /// Set when a change could not be persisted; consulted by the
    /// session coordinator's health check.
    storage_failed: AtomicBool,
}

impl RevisionManager {
    pub fn new(
        store: Arc<VersionStore>,
        protection: Arc<ProtectionRegistry>,
        max_versions_per_item: usize,
    ) -> Self {
        Self {
            store,
            protection,
            max_versions_per_item,
            storage_failed: AtomicBool::new(false),
        }
    }

    /// Whether a storage failure has been observed on the change pipeline
    pub fn storage_failed(&self) -> bool {
        self.storage_failed.load(Ordering::SeqCst)
    }

    /// Clear the storage failure flag after operator intervention
    pub fn reset_storage_failure(&self) {
        self.storage_failed.store(false, Ordering::SeqCst);
    }

    fn resolve_title(event: &ChangeEvent) -> String {
        event
            .title
            .clone()
            .unwrap_or_else(|| event.key.to_string())
    }

    /// Process one change notification.
    ///
    /// A denied change creates no version; it records a
    /// `protected-content-modified` warning and returns `PermissionDenied`.
    /// Exactly one storage attempt is made per notification, so redelivery
    /// must be deduplicated upstream.
    pub async fn handle_change(&self, event: ChangeEvent) -> Result<ContentVersion> {
        let check = self
            .protection
            .check_operation(&event.key, "update", event.approved)
            .await;
        if !check.allowed {
            let message = check
                .reason
                .unwrap_or_else(|| format!("Unapproved change to protected item {}", event.key));
            tracing::warn!("Refusing change to protected item {}: {}", event.key, message);
            self.store
                .append_warning(&Warning {
                    kind: WarningKind::ProtectedContentModified,
                    key: event.key.clone(),
                    timestamp: Utc::now(),
                    message: message.clone(),
                })
                .await?;
            return Err(EngineError::PermissionDenied(message));
        }

        let previous = match self.store.get_latest_version(&event.key).await {
            Ok(v) => Some(v),
            Err(EngineError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let changes = diff_summary(previous.as_ref().map(|v| &v.content), &event.payload);
        let title = Self::resolve_title(&event);
        let author = event.author.as_deref().unwrap_or("system");

        let version = self
            .store
            .create_version(&event.key, &title, event.payload, changes, author)
            .await?;
        self.enforce_retention(&event.key).await?;
        Ok(version)
    }

    async fn enforce_retention(&self, key: &ItemKey) -> Result<()> {
        let evicted = self
            .store
            .apply_retention(key, self.max_versions_per_item)
            .await?;
        for version in evicted {
            self.store
                .append_warning(&Warning {
                    kind: WarningKind::RetentionEvicted,
                    key: key.clone(),
                    timestamp: Utc::now(),
                    message: format!(
                        "Version {} (r{}) evicted by retention policy",
                        version.id, version.revision
                    ),
                })
                .await?;
        }
        Ok(())
    }

    /// Manual checkpoint: force a snapshot of every known item regardless
    /// of whether its payload changed, tagged with `label`. Used before
    /// risky bulk operations.
    pub async fn create_version_point(&self, label: &str) -> Result<Vec<ContentVersion>> {
        let keys = self.store.list_item_keys().await?;
        let mut snapshots = Vec::with_capacity(keys.len());
        for key in keys {
            let latest = self.store.get_latest_version(&key).await?;
            let version = self
                .store
                .create_version(
                    &key,
                    &latest.title,
                    latest.content.clone(),
                    vec![label.to_string()],
                    "system",
                )
                .await?;
            self.enforce_retention(&key).await?;
            snapshots.push(version);
        }
        tracing::info!("Version point {:?} captured {} item(s)", label, snapshots.len());
        Ok(snapshots)
    }

    /// Start consuming typed change notifications from a channel.
    ///
    /// Permission denials are already recorded as warnings and do not stop
    /// the loop; storage errors set the failure flag for the health check.
    pub fn subscribe(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ChangeEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let key = event.key.clone();
                match manager.handle_change(event).await {
                    Ok(version) => {
                        tracing::debug!("Versioned {} as r{}", key, version.revision);
                    }
                    Err(EngineError::PermissionDenied(_)) => {
                        // Already recorded as a warning
                    }
                    Err(e) if e.is_storage() => {
                        tracing::error!("Storage failure while versioning {}: {}", key, e);
                        manager.storage_failed.store(true, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::warn!("Dropped change notification for {}: {}", key, e);
                    }
                }
            }
            tracing::info!("Change notification channel closed");
        })
    }
}
