//! Core data model for Revault
//!
//! Content versions, backups, protection rules, and warnings.
//! Version identifiers are content-derived (SHA-256 over the key and
//! revision) so the same snapshot always gets the same id.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of content item the external store manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Course,
    Article,
    Product,
    Page,
}

impl ContentType {
    /// All known content types
    pub fn all() -> [ContentType; 4] {
        [
            ContentType::Course,
            ContentType::Article,
            ContentType::Product,
            ContentType::Page,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Course => "course",
            ContentType::Article => "article",
            ContentType::Product => "product",
            ContentType::Page => "page",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "course" => Ok(ContentType::Course),
            "article" => Ok(ContentType::Article),
            "product" => Ok(ContentType::Product),
            "page" => Ok(ContentType::Page),
            other => Err(format!("Unknown content type: {}", other)),
        }
    }
}

/// Identifies one content item in the external content store.
///
/// Item ids are opaque strings; callers with integer ids stringify them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub content_type: ContentType,
    pub item_id: String,
}

impl ItemKey {
    pub fn new(content_type: ContentType, item_id: impl Into<String>) -> Self {
        Self {
            content_type,
            item_id: item_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.content_type, self.item_id)
    }
}

/// Unique identifier for a stored version
///
/// Deterministically derived from `(content_type, item_id, revision)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionId([u8; 32]);

impl VersionId {
    /// Create a new VersionId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the id for a given key and revision
    pub fn derive(key: &ItemKey, revision: u64) -> Self {
        let seed = format!("{}:{}:{}", key.content_type, key.item_id, revision);
        let hash = Sha256::digest(seed.as_bytes());
        Self(hash.into())
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Lifecycle status of a version
///
/// `draft -> published -> archived`; an archived version is only
/// re-promoted to published through the restore manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Draft,
    Published,
    Archived,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Published => "published",
            VersionStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(VersionStatus::Draft),
            "published" => Ok(VersionStatus::Published),
            "archived" => Ok(VersionStatus::Archived),
            other => Err(format!("Unknown version status: {}", other)),
        }
    }
}

/// One immutable snapshot of one content item at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentVersion {
    /// Deterministic id, derived from key + revision
    pub id: VersionId,
    /// Item this version belongs to
    pub key: ItemKey,
    /// Display label copied from the payload at snapshot time
    pub title: String,
    /// Cosmetic dotted label ("1.<revision>")
    pub version: String,
    /// Strictly increasing per key, starting at 1
    pub revision: u64,
    /// Creation time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Actor that triggered the change
    pub author: String,
    /// Free-text change descriptions (never empty)
    pub changes: Vec<String>,
    /// Full serialized payload at this revision (never a diff)
    #[serde(with = "payload_bytes")]
    pub content: Bytes,
    /// Lifecycle status
    pub status: VersionStatus,
    /// Most recent backup that included this version
    pub backup_date: Option<DateTime<Utc>>,
}

impl ContentVersion {
    /// Render the cosmetic version label for a revision
    pub fn version_label(revision: u64) -> String {
        format!("1.{}", revision)
    }
}

/// Serde helper: payloads serialize as base64-free raw byte vectors
mod payload_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(b: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        b.as_ref().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        Ok(Bytes::from(Vec::<u8>::deserialize(d)?))
    }
}

/// What triggered a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupSource {
    Manual,
    Auto,
    Test,
}

impl fmt::Display for BackupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupSource::Manual => "manual",
            BackupSource::Auto => "auto",
            BackupSource::Test => "test",
        };
        write!(f, "{}", s)
    }
}

/// Reference to one captured version inside a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupItemRef {
    pub key: ItemKey,
    pub version_id: VersionId,
}

/// Immutable point-in-time bundle of version references
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub source: BackupSource,
    pub item_refs: Vec<BackupItemRef>,
}

/// Standing declaration that an item requires approval before mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionRule {
    pub key: ItemKey,
    pub title: String,
    pub reason: String,
}

/// Category of a non-fatal alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    #[serde(rename = "protected-content-modified")]
    ProtectedContentModified,
    #[serde(rename = "retention-evicted")]
    RetentionEvicted,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::ProtectedContentModified => "protected-content-modified",
            WarningKind::RetentionEvicted => "retention-evicted",
        }
    }
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WarningKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "protected-content-modified" => Ok(WarningKind::ProtectedContentModified),
            "retention-evicted" => Ok(WarningKind::RetentionEvicted),
            other => Err(format!("Unknown warning kind: {}", other)),
        }
    }
}

/// Non-fatal alert record, appended by the revision manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub key: ItemKey,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Inbound change notification from the content store
///
/// `approved` defaults to false; protected items require an explicit
/// operator approval to be versioned.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: ItemKey,
    pub title: Option<String>,
    pub payload: Bytes,
    pub author: Option<String>,
    pub approved: bool,
}

impl ChangeEvent {
    pub fn new(key: ItemKey, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            title: None,
            payload: payload.into(),
            author: None,
            approved: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn approved(mut self, approved: bool) -> Self {
        self.approved = approved;
        self
    }
}
