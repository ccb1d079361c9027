//! Rule compilation
//!
//! Every enforceable domain becomes one redirect rule that fires on
//! top-level navigation to the domain or any subdomain and sends the tab to
//! the local blocked page. Ids come from a range no other subsystem uses.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::is_valid_domain;
use crate::Result;

pub const RULE_ID_BASE: u32 = 10_000;
pub const RULE_ID_CAPACITY: u32 = 90_000;

const RULE_PRIORITY: u32 = 1;

pub fn is_reserved_rule_id(id: u32) -> bool {
    (RULE_ID_BASE..RULE_ID_BASE + RULE_ID_CAPACITY).contains(&id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
    SubFrame,
    Stylesheet,
    Script,
    Image,
    Xmlhttprequest,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTarget {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleAction {
    Redirect { redirect: RedirectTarget },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    /// `||domain^`: the domain and its subdomains
    pub url_filter: String,
    pub resource_types: Vec<ResourceType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

impl CompiledRule {
    /// The domain named by the url filter.
    pub fn domain(&self) -> Option<&str> {
        self.condition
            .url_filter
            .strip_prefix("||")
            .and_then(|rest| rest.strip_suffix('^'))
    }

    pub fn redirect_url(&self) -> &str {
        match &self.action {
            RuleAction::Redirect { redirect } => &redirect.url,
        }
    }

    pub fn applies_to(&self, resource_type: ResourceType) -> bool {
        self.condition.resource_types.contains(&resource_type)
    }
}

pub struct RuleCompiler {
    blocked_page: Url,
}

impl RuleCompiler {
    pub fn new(blocked_page: &str) -> Result<Self> {
        Ok(Self {
            blocked_page: Url::parse(blocked_page)?,
        })
    }

    /// Compile `active` (expected sorted) into rules with ids assigned in order
    /// from `RULE_ID_BASE`.
    pub fn compile(&self, active: &[String]) -> Vec<CompiledRule> {
        let mut rules = Vec::with_capacity(active.len().min(RULE_ID_CAPACITY as usize));

        for domain in active {
            if !is_valid_domain(domain) {
                tracing::warn!(domain = %domain, "Skipping malformed domain");
                continue;
            }
            if rules.len() as u32 >= RULE_ID_CAPACITY {
                tracing::warn!(
                    capacity = RULE_ID_CAPACITY,
                    dropped = active.len() - rules.len(),
                    "Rule id range exhausted"
                );
                break;
            }

            rules.push(CompiledRule {
                id: RULE_ID_BASE + rules.len() as u32,
                priority: RULE_PRIORITY,
                action: RuleAction::Redirect {
                    redirect: RedirectTarget {
                        url: self.redirect_url(domain),
                    },
                },
                condition: RuleCondition {
                    url_filter: format!("||{domain}^"),
                    resource_types: vec![ResourceType::MainFrame],
                },
            });
        }

        rules
    }

    fn redirect_url(&self, domain: &str) -> String {
        let mut url = self.blocked_page.clone();
        url.query_pairs_mut().append_pair("domain", domain);
        url.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> RuleCompiler {
        RuleCompiler::new("ext://siteguard/blocked.html").unwrap()
    }

    #[test]
    fn test_one_rule_per_domain() {
        let rules = compiler().compile(&["a.com".to_string(), "b.com".to_string()]);

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, RULE_ID_BASE);
        assert_eq!(rules[1].id, RULE_ID_BASE + 1);
        assert_eq!(rules[0].domain(), Some("a.com"));
        assert_eq!(rules[0].condition.url_filter, "||a.com^");
        assert_eq!(rules[0].condition.resource_types, vec![ResourceType::MainFrame]);
        assert_eq!(
            rules[1].redirect_url(),
            "ext://siteguard/blocked.html?domain=b.com"
        );
        assert!(rules.iter().all(|r| is_reserved_rule_id(r.id)));
    }

    #[test]
    fn test_redirect_is_url_encoded() {
        let compiler = compiler();
        let url = compiler.redirect_url("\"><script>alert(1)</script>");

        assert!(!url.contains('<'));
        assert!(!url.contains('"'));
        assert!(url.contains("domain=%22%3E%3Cscript%3E"));
    }

    #[test]
    fn test_malformed_domains_are_skipped() {
        let rules = compiler().compile(&["bad^filter.com".to_string(), "ok.com".to_string()]);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, RULE_ID_BASE);
    }

    #[test]
    fn test_serializes_like_a_dynamic_rule() {
        let rules = compiler().compile(&["a.com".to_string()]);
        let json = serde_json::to_value(&rules[0]).unwrap();

        assert_eq!(json["action"]["type"], "redirect");
        assert_eq!(json["condition"]["urlFilter"], "||a.com^");
        assert_eq!(json["condition"]["resourceTypes"][0], "main_frame");
    }

    #[test]
    fn test_reserved_range_bounds() {
        assert!(!is_reserved_rule_id(RULE_ID_BASE - 1));
        assert!(is_reserved_rule_id(RULE_ID_BASE));
        assert!(is_reserved_rule_id(RULE_ID_BASE + RULE_ID_CAPACITY - 1));
        assert!(!is_reserved_rule_id(RULE_ID_BASE + RULE_ID_CAPACITY));
    }
}
