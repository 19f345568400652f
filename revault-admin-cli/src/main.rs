//! Revault Administration CLI
//!
//! Management surface over the revision & backup engine: inspect versions,
//! manage protection rules, create backups, and run restores.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use revault_core::{
    BackupService, BackupSource, ContentStore, ContentType, EngineConfig, ItemKey,
    ProtectionRegistry, RestoreManager, RestoreOptions, RestoreTarget, RevisionManager,
    SessionCoordinator, VersionId, VersionStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "revault-admin")]
#[command(author = "Revault Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Revision & backup engine administration tool")]
struct Cli {
    /// Engine data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the engine data directory
    Init,

    /// Show aggregated session status and health
    Status,

    /// List versions of one item, or every version when no item is given
    Versions {
        /// Content type (course | article | product | page)
        #[arg(short = 't', long)]
        content_type: Option<ContentType>,
        /// Item id in the content store
        #[arg(short, long)]
        item_id: Option<String>,
    },

    /// List protected items
    Protected,

    /// Register a protection rule for an item
    Protect {
        #[arg(short = 't', long)]
        content_type: ContentType,
        #[arg(short, long)]
        item_id: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(short, long)]
        reason: String,
    },

    /// Create a manual full backup
    Backup {
        #[arg(short, long, default_value = "manual backup")]
        label: String,
    },

    /// List all backups, newest first
    Backups,

    /// Delete old backups whose contents are fully archived
    Cleanup {
        #[arg(long)]
        max_age_days: Option<i64>,
    },

    /// Restore a version or a whole backup
    Restore {
        /// Version id (hex) to restore
        #[arg(short, long, conflicts_with = "backup")]
        version: Option<String>,
        /// Backup id to restore
        #[arg(short, long)]
        backup: Option<Uuid>,
        /// Carry operator approval for protected items
        #[arg(long)]
        approved: bool,
        /// Plan only; show what would be restored
        #[arg(long)]
        dry_run: bool,
        /// Skip the automatic pre-restore safety backup
        #[arg(long)]
        no_safety_backup: bool,
    },

    /// List recorded warnings
    Warnings {
        /// Clear warnings after listing them
        #[arg(long)]
        clear: bool,
    },
}

/// Content store adapter that materializes adopted payloads as files
/// under `<data_dir>/content/`.
struct FsContentStore {
    content_dir: PathBuf,
}

impl FsContentStore {
    fn open(data_dir: &Path) -> Result<Self> {
        let content_dir = data_dir.join("content");
        std::fs::create_dir_all(&content_dir)?;
        Ok(Self { content_dir })
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn adopt(&self, key: &ItemKey, payload: Bytes) -> revault_core::Result<()> {
        let path = self
            .content_dir
            .join(format!("{}-{}.bin", key.content_type, key.item_id));
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, payload.as_ref())?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

struct Engine {
    config: EngineConfig,
    store: Arc<VersionStore>,
    protection: Arc<ProtectionRegistry>,
    revisions: Arc<RevisionManager>,
    backups: Arc<BackupService>,
}

impl Engine {
    fn open(data_dir: &Path) -> Result<Self> {
        let config = EngineConfig::load(data_dir)?;
        let store = Arc::new(VersionStore::open(data_dir)?);
        let protection = Arc::new(ProtectionRegistry::open(data_dir)?);
        let revisions = Arc::new(RevisionManager::new(
            store.clone(),
            protection.clone(),
            config.max_versions_per_item,
        ));
        let backups = Arc::new(BackupService::open(data_dir, store.clone())?);
        Ok(Self {
            config,
            store,
            protection,
            revisions,
            backups,
        })
    }

    fn coordinator(&self) -> Arc<SessionCoordinator> {
        Arc::new(SessionCoordinator::new(
            self.config.clone(),
            self.store.clone(),
            self.protection.clone(),
            self.revisions.clone(),
            self.backups.clone(),
        ))
    }

    fn restore_manager(&self) -> Result<RestoreManager> {
        let content_store = Arc::new(FsContentStore::open(&self.config.data_dir)?);
        Ok(RestoreManager::new(
            self.store.clone(),
            self.backups.clone(),
            self.protection.clone(),
            content_store,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let engine = Engine::open(&cli.data_dir)?;

    match cli.command {
        Commands::Init => {
            engine.config.save()?;
            let coordinator = engine.coordinator();
            coordinator.initialize().await?;
            println!("Engine initialized at {}", cli.data_dir.display());
        }

        Commands::Status => {
            let coordinator = engine.coordinator();
            coordinator.initialize().await?;
            let status = coordinator.get_status().await?;
            let healthy = coordinator.is_healthy().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            println!("healthy: {}", healthy);
        }

        Commands::Versions {
            content_type,
            item_id,
        } => {
            let versions = match (content_type, item_id) {
                (Some(ct), Some(id)) => {
                    engine
                        .store
                        .list_versions(&ItemKey::new(ct, id))
                        .await?
                }
                (None, None) => engine.store.list_all_versions().await?,
                _ => return Err(anyhow!("--content-type and --item-id go together")),
            };
            for v in versions {
                println!(
                    "{}  {}  r{}  {}  {}  {}  [{}]",
                    v.id,
                    v.key,
                    v.revision,
                    v.status,
                    v.timestamp.to_rfc3339(),
                    v.author,
                    v.changes.join("; "),
                );
            }
        }

        Commands::Protected => {
            for rule in engine.protection.list_rules().await {
                println!("{}  {}  ({})", rule.key, rule.title, rule.reason);
            }
        }

        Commands::Protect {
            content_type,
            item_id,
            title,
            reason,
        } => {
            let key = ItemKey::new(content_type, item_id);
            let title = if title.is_empty() {
                key.to_string()
            } else {
                title
            };
            engine.protection.add_rule(key.clone(), title, reason).await?;
            println!("Protection rule registered for {}", key);
        }

        Commands::Backup { label } => {
            let backup = engine
                .backups
                .create_full_backup(&label, BackupSource::Manual)
                .await?;
            println!(
                "Backup {} created ({} item refs)",
                backup.id,
                backup.item_refs.len()
            );
        }

        Commands::Backups => {
            for backup in engine.backups.get_all_backups().await? {
                println!(
                    "{}  {}  {}  {:?}  {} item(s)",
                    backup.id,
                    backup.timestamp.to_rfc3339(),
                    backup.source,
                    backup.label,
                    backup.item_refs.len()
                );
            }
        }

        Commands::Cleanup { max_age_days } => {
            let days = max_age_days.unwrap_or(engine.config.backup_retention_days);
            let deleted = engine.backups.cleanup(days).await?;
            println!("Deleted {} backup(s)", deleted.len());
        }

        Commands::Restore {
            version,
            backup,
            approved,
            dry_run,
            no_safety_backup,
        } => {
            let target = match (version, backup) {
                (Some(hex), None) => RestoreTarget::Version(
                    VersionId::from_hex(&hex).map_err(|e| anyhow!("Bad version id: {}", e))?,
                ),
                (None, Some(id)) => RestoreTarget::Backup(id),
                _ => return Err(anyhow!("Pass exactly one of --version or --backup")),
            };
            // Protection checks only apply once the engine is initialized
            engine.protection.set_enforcement(true);

            let manager = engine.restore_manager()?;
            let options = RestoreOptions {
                create_backup_before_restore: !no_safety_backup,
                dry_run,
            };
            let plan = manager.prepare_restore(target, options).await?;
            println!("Plan: {} item(s)", plan.entries.len());
            for conflict in &plan.conflicts {
                println!("conflict: {}  {}", conflict.item.key, conflict.reason);
            }
            if dry_run {
                for entry in &plan.entries {
                    println!("would restore: {}  {}", entry.key, entry.version_id);
                }
                return Ok(());
            }

            let report = manager.execute_restore(&plan, approved).await?;
            for v in &report.restored {
                println!("restored: {}  r{}", v.key, v.revision);
            }
            for failure in &report.errors {
                println!("failed: {}  {}", failure.item.key, failure.error);
            }
            if !report.success() {
                return Err(anyhow!("Restore failed for every item"));
            }
        }

        Commands::Warnings { clear } => {
            let warnings = engine.store.list_warnings().await?;
            for w in &warnings {
                println!(
                    "{}  {}  {}  {}",
                    w.timestamp.to_rfc3339(),
                    w.kind,
                    w.key,
                    w.message
                );
            }
            if clear {
                let cleared = engine.store.clear_warnings().await?;
                println!("Cleared {} warning(s)", cleared);
            }
        }
    }

    Ok(())
}
