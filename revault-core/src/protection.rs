//! Protection registry
//!
//! Curated items require explicit operator approval before any mutating
//! operation (update or restore) may touch them. Rules are persisted as
//! `protection.json` under the data dir with an in-memory cache; the
//! evaluation itself is a pure function.

use crate::error::Result;
use crate::model::{ItemKey, ProtectionRule};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Outcome of a protection check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl OperationCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }
}

/// Pure protection rule evaluation.
///
/// Unprotected items are always allowed; protected items are allowed only
/// when the caller carries an explicit approval.
pub fn check_operation(
    rule: Option<&ProtectionRule>,
    key: &ItemKey,
    operation: &str,
    approved: bool,
) -> OperationCheck {
    match rule {
        None => OperationCheck::allowed(),
        Some(_) if approved => OperationCheck::allowed(),
        Some(rule) => OperationCheck {
            allowed: false,
            reason: Some(format!(
                "{} on {} requires approval: {}",
                operation, key, rule.reason
            )),
        },
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleFile {
    rules: Vec<ProtectionRule>,
}

/// Durable registry of protection rules, keyed by `(content_type, item_id)`
pub struct ProtectionRegistry {
    path: PathBuf,
    rules: RwLock<HashMap<ItemKey, ProtectionRule>>,
    /// Enforcement gate flipped on by the session coordinator; while off,
    /// every check is allowed (startup has not completed yet).
    enforcing: AtomicBool,
}

impl ProtectionRegistry {
    /// Open the registry, loading any existing rule file
    pub fn open(data_dir: &std::path::Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join("protection.json");
        let mut rules = HashMap::new();
        if path.exists() {
            let data = fs::read_to_string(&path)?;
            let file: RuleFile = serde_json::from_str(&data)?;
            for rule in file.rules {
                rules.insert(rule.key.clone(), rule);
            }
        }
        Ok(Self {
            path,
            rules: RwLock::new(rules),
            enforcing: AtomicBool::new(false),
        })
    }

    async fn save(&self, rules: &HashMap<ItemKey, ProtectionRule>) -> Result<()> {
        let mut sorted: Vec<ProtectionRule> = rules.values().cloned().collect();
        sorted.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        let file = RuleFile { rules: sorted };
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(&file)?)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Enable or disable enforcement
    pub fn set_enforcement(&self, enabled: bool) {
        self.enforcing.store(enabled, Ordering::SeqCst);
        tracing::info!(
            "Content protection enforcement {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Whether checks are currently being enforced
    pub fn is_enforcing(&self) -> bool {
        self.enforcing.load(Ordering::SeqCst)
    }

    /// Idempotent upsert of a protection rule
    pub async fn add_rule(
        &self,
        key: ItemKey,
        title: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<()> {
        let rule = ProtectionRule {
            key: key.clone(),
            title: title.into(),
            reason: reason.into(),
        };
        let mut rules = self.rules.write().await;
        rules.insert(key, rule);
        self.save(&rules).await
    }

    /// Remove a rule; returns the removed rule if one existed
    pub async fn remove_rule(&self, key: &ItemKey) -> Result<Option<ProtectionRule>> {
        let mut rules = self.rules.write().await;
        let removed = rules.remove(key);
        if removed.is_some() {
            self.save(&rules).await?;
        }
        Ok(removed)
    }

    /// Whether an item carries a protection rule
    pub async fn is_protected(&self, key: &ItemKey) -> bool {
        self.rules.read().await.contains_key(key)
    }

    /// All registered rules
    pub async fn list_rules(&self) -> Vec<ProtectionRule> {
        let mut out: Vec<ProtectionRule> = self.rules.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        out
    }

    /// Evaluate whether an operation on an item may proceed.
    ///
    /// Returns `allowed = true` unconditionally when the item is not
    /// protected or enforcement is off; otherwise approval decides.
    pub async fn check_operation(
        &self,
        key: &ItemKey,
        operation: &str,
        approved: bool,
    ) -> OperationCheck {
        if !self.is_enforcing() {
            return OperationCheck::allowed();
        }
        let rules = self.rules.read().await;
        check_operation(rules.get(key), key, operation, approved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentType;
    use tempfile::TempDir;

    fn key() -> ItemKey {
        ItemKey::new(ContentType::Article, "2")
    }

    fn rule() -> ProtectionRule {
        ProtectionRule {
            key: key(),
            title: "Research article".into(),
            reason: "original research article".into(),
        }
    }

    #[test]
    fn test_check_operation_truth_table() {
        let r = rule();
        let k = key();
        // {protected, approved} x {true, false}
        assert!(check_operation(None, &k, "update", false).allowed);
        assert!(check_operation(None, &k, "update", true).allowed);
        assert!(check_operation(Some(&r), &k, "update", true).allowed);
        let denied = check_operation(Some(&r), &k, "update", false);
        assert!(!denied.allowed);
        let reason = denied.reason.unwrap();
        assert!(reason.contains("original research article"), "got: {}", reason);
        assert!(reason.contains("update"));
    }

    #[tokio::test]
    async fn test_add_rule_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let registry = ProtectionRegistry::open(tmp.path()).unwrap();
        registry.add_rule(key(), "Article", "reason one").await.unwrap();
        registry.add_rule(key(), "Article", "reason two").await.unwrap();

        let rules = registry.list_rules().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].reason, "reason two");
    }

    #[tokio::test]
    async fn test_rules_persist_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let registry = ProtectionRegistry::open(tmp.path()).unwrap();
            registry.add_rule(key(), "Article", "keep safe").await.unwrap();
        }
        {
            let registry = ProtectionRegistry::open(tmp.path()).unwrap();
            assert!(registry.is_protected(&key()).await);
        }
    }

    #[tokio::test]
    async fn test_enforcement_gate() {
        let tmp = TempDir::new().unwrap();
        let registry = ProtectionRegistry::open(tmp.path()).unwrap();
        registry.add_rule(key(), "Article", "keep safe").await.unwrap();

        // Not enforcing yet: everything allowed
        assert!(registry.check_operation(&key(), "update", false).await.allowed);

        registry.set_enforcement(true);
        assert!(!registry.check_operation(&key(), "update", false).await.allowed);
        assert!(registry.check_operation(&key(), "update", true).await.allowed);
    }

    #[tokio::test]
    async fn test_remove_rule() {
        let tmp = TempDir::new().unwrap();
        let registry = ProtectionRegistry::open(tmp.path()).unwrap();
        registry.set_enforcement(true);
        registry.add_rule(key(), "Article", "keep safe").await.unwrap();

        let removed = registry.remove_rule(&key()).await.unwrap();
        assert!(removed.is_some());
        assert!(!registry.is_protected(&key()).await);
        assert!(registry.check_operation(&key(), "update", false).await.allowed);
        assert!(registry.remove_rule(&key()).await.unwrap().is_none());
    }
}
