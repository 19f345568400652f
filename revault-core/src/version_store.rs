//! SQLite-backed version store
//!
//! Owns the `ContentVersion` and `Warning` records. Versions are stored in
//! an SQLite database with WAL mode; the connection mutex plus
//! single-transaction revision allocation guarantees that concurrent
//! snapshots of the same item never receive the same revision.

use crate::error::{EngineError, Result};
use crate::model::{ContentVersion, ItemKey, VersionId, VersionStatus, Warning, WarningKind};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

fn open_version_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS versions (
            id BLOB PRIMARY KEY,
            content_type TEXT NOT NULL,
            item_id TEXT NOT NULL,
            title TEXT NOT NULL,
            revision INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            author TEXT NOT NULL,
            changes TEXT NOT NULL,
            content BLOB NOT NULL,
            status TEXT NOT NULL,
            backup_date TEXT,
            UNIQUE(content_type, item_id, revision)
        );
        CREATE INDEX IF NOT EXISTS idx_versions_key
            ON versions(content_type, item_id);
        CREATE TABLE IF NOT EXISTS warnings (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            content_type TEXT NOT NULL,
            item_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            message TEXT NOT NULL
        );",
    )?;
    Ok(conn)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(format!("Bad timestamp {:?}: {}", s, e)))
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawVersion> {
    Ok(RawVersion {
        id: row.get(0)?,
        content_type: row.get(1)?,
        item_id: row.get(2)?,
        title: row.get(3)?,
        revision: row.get::<_, i64>(4)? as u64,
        timestamp: row.get(5)?,
        author: row.get(6)?,
        changes: row.get(7)?,
        content: row.get(8)?,
        status: row.get(9)?,
        backup_date: row.get(10)?,
    })
}

/// Intermediate row shape before field parsing
struct RawVersion {
    id: Vec<u8>,
    content_type: String,
    item_id: String,
    title: String,
    revision: u64,
    timestamp: String,
    author: String,
    changes: String,
    content: Vec<u8>,
    status: String,
    backup_date: Option<String>,
}

impl RawVersion {
    fn into_version(self) -> Result<ContentVersion> {
        let mut arr = [0u8; 32];
        if self.id.len() != 32 {
            return Err(EngineError::Storage(format!(
                "Corrupt version id ({} bytes)",
                self.id.len()
            )));
        }
        arr.copy_from_slice(&self.id);
        let content_type = self
            .content_type
            .parse()
            .map_err(EngineError::Storage)?;
        let status = VersionStatus::from_str(&self.status).map_err(EngineError::Storage)?;
        let changes: Vec<String> = serde_json::from_str(&self.changes)?;
        let backup_date = match self.backup_date {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        };
        Ok(ContentVersion {
            id: VersionId::new(arr),
            key: ItemKey {
                content_type,
                item_id: self.item_id,
            },
            title: self.title,
            version: ContentVersion::version_label(self.revision),
            revision: self.revision,
            timestamp: parse_ts(&self.timestamp)?,
            author: self.author,
            changes,
            content: Bytes::from(self.content),
            status,
            backup_date,
        })
    }
}

const VERSION_COLS: &str =
    "id, content_type, item_id, title, revision, timestamp, author, changes, content, status, backup_date";

/// Durable store for content versions and warnings
pub struct VersionStore {
    conn: Mutex<Connection>,
}

impl VersionStore {
    /// Open or create the version database under a data directory
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = open_version_db(&data_dir.join("versions.sqlite"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("version store mutex poisoned")
    }

    /// Allocate the next revision for a key and store a new draft version.
    ///
    /// Allocation and insert happen in one transaction, so two concurrent
    /// calls for the same key always observe distinct revisions.
    pub async fn create_version(
        &self,
        key: &ItemKey,
        title: &str,
        payload: Bytes,
        changes: Vec<String>,
        author: &str,
    ) -> Result<ContentVersion> {
        if changes.is_empty() {
            return Err(EngineError::Validation(
                "A version requires at least one change description".into(),
            ));
        }
        if payload.is_empty() {
            return Err(EngineError::Validation(format!(
                "Refusing to snapshot {} with an empty payload",
                key
            )));
        }

        let mut guard = self.conn();
        let tx = guard.transaction()?;

        let revision: u64 = tx.query_row(
            "SELECT COALESCE(MAX(revision), 0) + 1 FROM versions
             WHERE content_type = ?1 AND item_id = ?2",
            rusqlite::params![key.content_type.as_str(), key.item_id],
            |r| r.get::<_, i64>(0),
        )? as u64;

        let id = VersionId::derive(key, revision);
        let now = Utc::now();
        tx.execute(
            "INSERT INTO versions (id, content_type, item_id, title, revision, timestamp,
                                   author, changes, content, status, backup_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL)",
            rusqlite::params![
                id.as_bytes().as_slice(),
                key.content_type.as_str(),
                key.item_id,
                title,
                revision as i64,
                now.to_rfc3339(),
                author,
                serde_json::to_string(&changes)?,
                payload.as_ref(),
                VersionStatus::Draft.as_str(),
            ],
        )?;
        tx.commit()?;

        tracing::debug!("Created version r{} for {} ({})", revision, key, id);
        Ok(ContentVersion {
            id,
            key: key.clone(),
            title: title.to_string(),
            version: ContentVersion::version_label(revision),
            revision,
            timestamp: now,
            author: author.to_string(),
            changes,
            content: payload,
            status: VersionStatus::Draft,
            backup_date: None,
        })
    }

    /// Look up a version by id
    pub async fn get_version(&self, id: VersionId) -> Result<ContentVersion> {
        let guard = self.conn();
        let raw = guard
            .query_row(
                &format!("SELECT {} FROM versions WHERE id = ?1", VERSION_COLS),
                rusqlite::params![id.as_bytes().as_slice()],
                row_to_version,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("Version {} not found", id))
                }
                other => other.into(),
            })?;
        raw.into_version()
    }

    /// Highest-revision version for a key, regardless of status
    pub async fn get_latest_version(&self, key: &ItemKey) -> Result<ContentVersion> {
        let guard = self.conn();
        let raw = guard
            .query_row(
                &format!(
                    "SELECT {} FROM versions
                     WHERE content_type = ?1 AND item_id = ?2
                     ORDER BY revision DESC LIMIT 1",
                    VERSION_COLS
                ),
                rusqlite::params![key.content_type.as_str(), key.item_id],
                row_to_version,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("No versions for {}", key))
                }
                other => other.into(),
            })?;
        raw.into_version()
    }

    /// The unique published version for a key, if any
    pub async fn get_published_version(&self, key: &ItemKey) -> Result<ContentVersion> {
        let guard = self.conn();
        let raw = guard
            .query_row(
                &format!(
                    "SELECT {} FROM versions
                     WHERE content_type = ?1 AND item_id = ?2 AND status = 'published'",
                    VERSION_COLS
                ),
                rusqlite::params![key.content_type.as_str(), key.item_id],
                row_to_version,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("No published version for {}", key))
                }
                other => other.into(),
            })?;
        raw.into_version()
    }

    /// All versions for a key, newest revision first
    pub async fn list_versions(&self, key: &ItemKey) -> Result<Vec<ContentVersion>> {
        let guard = self.conn();
        let mut stmt = guard.prepare_cached(&format!(
            "SELECT {} FROM versions
             WHERE content_type = ?1 AND item_id = ?2
             ORDER BY revision DESC",
            VERSION_COLS
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![key.content_type.as_str(), key.item_id],
            row_to_version,
        )?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_version()?);
        }
        Ok(out)
    }

    /// Every version in the store, newest first
    pub async fn list_all_versions(&self) -> Result<Vec<ContentVersion>> {
        let guard = self.conn();
        let mut stmt = guard.prepare_cached(&format!(
            "SELECT {} FROM versions ORDER BY timestamp DESC, revision DESC",
            VERSION_COLS
        ))?;
        let rows = stmt.query_map([], row_to_version)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_version()?);
        }
        Ok(out)
    }

    /// Distinct item keys known to the store
    pub async fn list_item_keys(&self) -> Result<Vec<ItemKey>> {
        let guard = self.conn();
        let mut stmt = guard.prepare_cached(
            "SELECT DISTINCT content_type, item_id FROM versions
             ORDER BY content_type, item_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (ct, item_id) = row?;
            out.push(ItemKey {
                content_type: ct.parse().map_err(EngineError::Storage)?,
                item_id,
            });
        }
        Ok(out)
    }

    /// Transition a version's status.
    ///
    /// Promoting to `published` demotes the previously published version of
    /// the same key to `archived` in the same transaction, so no reader
    /// ever observes two published versions for one key.
    pub async fn set_status(&self, id: VersionId, status: VersionStatus) -> Result<ContentVersion> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;

        let raw = tx
            .query_row(
                &format!("SELECT {} FROM versions WHERE id = ?1", VERSION_COLS),
                rusqlite::params![id.as_bytes().as_slice()],
                row_to_version,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("Version {} not found", id))
                }
                other => other.into(),
            })?;
        let mut version = raw.into_version()?;

        if version.status == VersionStatus::Published && status == VersionStatus::Draft {
            return Err(EngineError::Validation(format!(
                "Version {} is published and cannot move back to draft",
                id
            )));
        }

        if status == VersionStatus::Published {
            tx.execute(
                "UPDATE versions SET status = 'archived'
                 WHERE content_type = ?1 AND item_id = ?2
                   AND status = 'published' AND id != ?3",
                rusqlite::params![
                    version.key.content_type.as_str(),
                    version.key.item_id,
                    id.as_bytes().as_slice(),
                ],
            )?;
        }
        tx.execute(
            "UPDATE versions SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.as_str(), id.as_bytes().as_slice()],
        )?;
        tx.commit()?;

        version.status = status;
        tracing::debug!("Version {} of {} is now {}", version.revision, version.key, status);
        Ok(version)
    }

    /// Evict the oldest non-published versions of a key until the count is
    /// within `max_versions`. The published version is never evicted.
    /// Returns the evicted versions so the caller can record warnings.
    pub async fn apply_retention(
        &self,
        key: &ItemKey,
        max_versions: usize,
    ) -> Result<Vec<ContentVersion>> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM versions WHERE content_type = ?1 AND item_id = ?2",
            rusqlite::params![key.content_type.as_str(), key.item_id],
            |r| r.get(0),
        )?;
        let excess = (count as usize).saturating_sub(max_versions);
        if excess == 0 {
            return Ok(Vec::new());
        }

        let mut evicted = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM versions
                 WHERE content_type = ?1 AND item_id = ?2 AND status != 'published'
                 ORDER BY revision ASC LIMIT ?3",
                VERSION_COLS
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![key.content_type.as_str(), key.item_id, excess as i64],
                row_to_version,
            )?;
            for raw in rows {
                evicted.push(raw?.into_version()?);
            }
        }
        for version in &evicted {
            tx.execute(
                "DELETE FROM versions WHERE id = ?1",
                rusqlite::params![version.id.as_bytes().as_slice()],
            )?;
        }
        tx.commit()?;

        if !evicted.is_empty() {
            tracing::info!("Retention evicted {} version(s) of {}", evicted.len(), key);
        }
        Ok(evicted)
    }

    /// Stamp `backup_date` on the versions captured by a backup
    pub async fn mark_backed_up(
        &self,
        version_ids: &[VersionId],
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        for id in version_ids {
            tx.execute(
                "UPDATE versions SET backup_date = ?1 WHERE id = ?2",
                rusqlite::params![timestamp.to_rfc3339(), id.as_bytes().as_slice()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Warnings ───────────────────────────────────────────────

    /// Append a non-fatal alert record
    pub async fn append_warning(&self, warning: &Warning) -> Result<()> {
        self.conn().execute(
            "INSERT INTO warnings (kind, content_type, item_id, timestamp, message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                warning.kind.as_str(),
                warning.key.content_type.as_str(),
                warning.key.item_id,
                warning.timestamp.to_rfc3339(),
                warning.message,
            ],
        )?;
        Ok(())
    }

    /// All warnings, oldest first
    pub async fn list_warnings(&self) -> Result<Vec<Warning>> {
        let guard = self.conn();
        let mut stmt = guard.prepare_cached(
            "SELECT kind, content_type, item_id, timestamp, message
             FROM warnings ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (kind, ct, item_id, ts, message) = row?;
            out.push(Warning {
                kind: WarningKind::from_str(&kind).map_err(EngineError::Storage)?,
                key: ItemKey {
                    content_type: ct.parse().map_err(EngineError::Storage)?,
                    item_id,
                },
                timestamp: parse_ts(&ts)?,
                message,
            });
        }
        Ok(out)
    }

    /// Number of recorded warnings
    pub async fn warning_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM warnings", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Clear all warnings after an operator has reviewed them
    pub async fn clear_warnings(&self) -> Result<usize> {
        let cleared = self.conn().execute("DELETE FROM warnings", [])?;
        Ok(cleared)
    }
}
