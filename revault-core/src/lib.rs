//! Revault Core Library
//!
//! Revision & backup engine for a content catalog:
//! - Data model (ContentVersion, Backup, ProtectionRule, Warning)
//! - SQLite-backed version store with atomic revision allocation
//! - Protection registry with a pure rule evaluator
//! - Revision manager consuming typed change notifications
//! - Backup service with point-in-time manifests and age cleanup
//! - Restore manager with dry-run planning and per-item rollback
//! - Session coordinator for startup, auto-save ticks, and health

pub mod backup;
pub mod config;
pub mod error;
pub mod model;
pub mod protection;
pub mod restore;
pub mod revision_manager;
pub mod session;
pub mod version_store;

pub use backup::BackupService;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use model::{
    Backup, BackupItemRef, BackupSource, ChangeEvent, ContentType, ContentVersion, ItemKey,
    ProtectionRule, VersionId, VersionStatus, Warning, WarningKind,
};
pub use protection::{check_operation, OperationCheck, ProtectionRegistry};
pub use restore::{
    CancelFlag, ContentStore, RestoreFailure, RestoreManager, RestoreOptions, RestorePlan,
    RestoreReport, RestoreTarget,
};
pub use revision_manager::{diff_summary, RevisionManager};
pub use session::{SessionCoordinator, SessionStatus};
pub use version_store::VersionStore;
