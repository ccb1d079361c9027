//! Enforcement layer
//!
//! The host-side rule table. Rule sets are swapped with a single
//! `update_rules` call so no caller ever observes half an update.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

use crate::rules::{CompiledRule, ResourceType};

#[derive(Error, Debug)]
pub enum EnforcementError {
    #[error("Rule update rejected: {0}")]
    Rejected(String),

    #[error("Enforcement layer unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EnforcementLayer: Send + Sync {
    /// Ids of every installed rule, including rules owned by other subsystems.
    async fn installed_rule_ids(&self) -> Result<Vec<u32>, EnforcementError>;

    /// Remove `remove_rule_ids` and install `add_rules` as one atomic step.
    async fn update_rules(
        &self,
        remove_rule_ids: Vec<u32>,
        add_rules: Vec<CompiledRule>,
    ) -> Result<(), EnforcementError>;
}

/// Rule table kept in memory; evaluates navigations against installed rules.
pub struct InMemoryEnforcer {
    rules: RwLock<BTreeMap<u32, CompiledRule>>,
}

impl InMemoryEnforcer {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
        }
    }

    /// Installed rules ordered by id.
    pub fn rules(&self) -> Vec<CompiledRule> {
        self.rules.read().values().cloned().collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Where a request to `url` would be redirected, if anywhere.
    pub fn redirect_for(&self, url: &str, resource_type: ResourceType) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_lowercase();
        let rules = self.rules.read();

        // The host itself first, then each parent domain
        let parts: Vec<&str> = host.split('.').collect();
        for i in 0..parts.len() {
            let parent = parts[i..].join(".");
            let hit = rules
                .values()
                .filter(|rule| rule.applies_to(resource_type))
                .find(|rule| rule.domain() == Some(parent.as_str()));
            if let Some(rule) = hit {
                return Some(rule.redirect_url().to_string());
            }
        }

        None
    }

    pub fn blocks(&self, url: &str) -> bool {
        self.redirect_for(url, ResourceType::MainFrame).is_some()
    }
}

impl Default for InMemoryEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnforcementLayer for InMemoryEnforcer {
    async fn installed_rule_ids(&self) -> Result<Vec<u32>, EnforcementError> {
        Ok(self.rules.read().keys().copied().collect())
    }

    async fn update_rules(
        &self,
        remove_rule_ids: Vec<u32>,
        add_rules: Vec<CompiledRule>,
    ) -> Result<(), EnforcementError> {
        let mut rules = self.rules.write();

        let mut next = rules.clone();
        for id in &remove_rule_ids {
            next.remove(id);
        }
        for rule in add_rules {
            if next.contains_key(&rule.id) {
                return Err(EnforcementError::Rejected(format!(
                    "duplicate rule id {}",
                    rule.id
                )));
            }
            next.insert(rule.id, rule);
        }

        *rules = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleCompiler;

    fn compile(domains: &[&str]) -> Vec<CompiledRule> {
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        RuleCompiler::new("ext://siteguard/blocked.html")
            .unwrap()
            .compile(&domains)
    }

    #[tokio::test]
    async fn test_redirects_domain_and_subdomains() {
        let enforcer = InMemoryEnforcer::new();
        enforcer
            .update_rules(vec![], compile(&["tracker.com"]))
            .await
            .unwrap();

        assert!(enforcer.blocks("https://tracker.com/pixel"));
        assert!(enforcer.blocks("https://sub.tracker.com/page"));
        assert!(!enforcer.blocks("https://nottracker.com/"));
        assert!(!enforcer.blocks("https://example.com/"));
        assert_eq!(
            enforcer.redirect_for("https://tracker.com/", ResourceType::MainFrame),
            Some("ext://siteguard/blocked.html?domain=tracker.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_subresources_pass_through() {
        let enforcer = InMemoryEnforcer::new();
        enforcer
            .update_rules(vec![], compile(&["tracker.com"]))
            .await
            .unwrap();

        assert!(enforcer
            .redirect_for("https://tracker.com/a.js", ResourceType::Script)
            .is_none());
        assert!(enforcer
            .redirect_for("https://tracker.com/frame", ResourceType::SubFrame)
            .is_none());
    }

    #[tokio::test]
    async fn test_rejected_update_changes_nothing() {
        let enforcer = InMemoryEnforcer::new();
        enforcer
            .update_rules(vec![], compile(&["a.com"]))
            .await
            .unwrap();

        let result = enforcer.update_rules(vec![], compile(&["b.com"])).await;
        assert!(matches!(result, Err(EnforcementError::Rejected(_))));
        assert!(enforcer.blocks("https://a.com/"));
        assert!(!enforcer.blocks("https://b.com/"));
    }
}
