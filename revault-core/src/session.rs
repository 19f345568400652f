//! Session coordinator
//!
//! Startup sequencing, periodic auto-save ticks, and aggregated status for
//! the presentation layer.

use crate::backup::BackupService;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::{BackupSource, ChangeEvent};
use crate::protection::ProtectionRegistry;
use crate::revision_manager::RevisionManager;
use crate::version_store::VersionStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Aggregated engine status for dashboards and CLIs
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub initialized: bool,
    pub auto_save_active: bool,
    pub last_active_time: DateTime<Utc>,
    pub session_duration_seconds: i64,
    pub total_warnings: usize,
}

/// Orchestrates startup, background ticks, and health reporting
pub struct SessionCoordinator {
    config: EngineConfig,
    store: Arc<VersionStore>,
    protection: Arc<ProtectionRegistry>,
    revisions: Arc<RevisionManager>,
    backups: Arc<BackupService>,
    initialized: AtomicBool,
    auto_save_active: AtomicBool,
    session_start: Mutex<DateTime<Utc>>,
    last_active: Mutex<DateTime<Utc>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionCoordinator {
    pub fn new(
        config: EngineConfig,
        store: Arc<VersionStore>,
        protection: Arc<ProtectionRegistry>,
        revisions: Arc<RevisionManager>,
        backups: Arc<BackupService>,
    ) -> Self {
        let now = Utc::now();
        Self {
            config,
            store,
            protection,
            revisions,
            backups,
            initialized: AtomicBool::new(false),
            auto_save_active: AtomicBool::new(false),
            session_start: Mutex::new(now),
            last_active: Mutex::new(now),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn touch(&self) {
        *self.last_active.lock().await = Utc::now();
    }

    /// Startup sequence: enable protection enforcement and guarantee that
    /// at least one backup exists. Idempotent — a second call is a no-op.
    /// A failed startup leaves the coordinator uninitialized so the caller
    /// can retry.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.run_startup().await {
            self.initialized.store(false, Ordering::SeqCst);
            tracing::error!("Session startup failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    async fn run_startup(&self) -> Result<()> {
        self.protection.set_enforcement(true);

        if self.backups.get_all_backups().await?.is_empty() {
            self.backups
                .create_full_backup("initial backup", BackupSource::Auto)
                .await?;
        }

        let now = Utc::now();
        *self.session_start.lock().await = now;
        *self.last_active.lock().await = now;
        tracing::info!("Session initialized");
        Ok(())
    }

    /// Start the change subscription and the periodic auto-save ticker
    pub async fn start_auto_save(
        self: &Arc<Self>,
        events: mpsc::Receiver<ChangeEvent>,
    ) -> Result<()> {
        let subscription = self.revisions.subscribe(events);

        let coordinator = Arc::clone(self);
        let interval_secs = self.config.auto_save_interval_secs;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            // The first tick fires immediately; skip it
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = coordinator.run_auto_save_tick().await {
                    tracing::error!("Auto-save tick failed: {}", e);
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(subscription);
        tasks.push(ticker);
        self.auto_save_active.store(true, Ordering::SeqCst);
        tracing::info!("Auto-save active (every {}s)", interval_secs);
        Ok(())
    }

    async fn run_auto_save_tick(&self) -> Result<()> {
        self.revisions.create_version_point("auto-save").await?;
        self.backups
            .create_full_backup("auto-save", BackupSource::Auto)
            .await?;
        self.backups
            .cleanup(self.config.backup_retention_days)
            .await?;
        self.touch().await;
        Ok(())
    }

    /// Manual trigger for a whole-catalog version point
    pub async fn force_auto_save(&self) -> Result<usize> {
        let snapshots = self.revisions.create_version_point("manual save point").await?;
        self.touch().await;
        Ok(snapshots.len())
    }

    /// Manual trigger for a full backup
    pub async fn force_backup(&self, label: &str) -> Result<crate::model::Backup> {
        let backup = self
            .backups
            .create_full_backup(label, BackupSource::Manual)
            .await?;
        self.touch().await;
        Ok(backup)
    }

    /// Aggregated status snapshot
    pub async fn get_status(&self) -> Result<SessionStatus> {
        let start = *self.session_start.lock().await;
        Ok(SessionStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            auto_save_active: self.auto_save_active.load(Ordering::SeqCst),
            last_active_time: *self.last_active.lock().await,
            session_duration_seconds: (Utc::now() - start).num_seconds(),
            total_warnings: self.store.warning_count().await?,
        })
    }

    /// Healthy iff initialized, no unresolved warnings, and no storage
    /// failure on the change pipeline. Reads are never blocked by an
    /// unhealthy state; it only prompts operator attention.
    pub async fn is_healthy(&self) -> bool {
        if !self.initialized.load(Ordering::SeqCst) || self.revisions.storage_failed() {
            return false;
        }
        match self.store.warning_count().await {
            Ok(count) => count == 0,
            Err(_) => false,
        }
    }

    /// Stop background tasks
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.auto_save_active.store(false, Ordering::SeqCst);
        tracing::info!("Session shut down");
    }
}
