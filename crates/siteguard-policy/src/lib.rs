//! SiteGuard Policy
//!
//! Decides which declared domains may actually be enforced and turns them
//! into redirect rules:
//! - A domain is enforceable only while the process holds a host grant for it,
//!   or while a short-lived pending grant bridges an in-flight permission request
//! - Domains whose grant has lapsed are dropped from the persisted blocklist
//! - Each enforceable domain compiles to one top-level-navigation redirect rule
//!   with an id from a reserved range

mod domain;
mod enforcement;
mod error;
mod pending;
mod permissions;
mod reconciler;
mod rules;

pub use domain::{is_valid_domain, normalize_domain, normalize_list, MAX_DOMAIN_LEN};
pub use enforcement::{EnforcementError, EnforcementLayer, InMemoryEnforcer};
pub use error::PolicyError;
pub use pending::{PendingGrantLedger, PENDING_GRANT_TTL_MS};
pub use permissions::{
    origin_patterns, CapabilityError, CapabilitySystem, GrantTable, PermissionOracle,
    RetryPolicy, ALL_URLS,
};
pub use reconciler::{PermissionReconciler, Reconciliation};
pub use rules::{
    is_reserved_rule_id, CompiledRule, RedirectTarget, ResourceType, RuleAction, RuleCompiler,
    RuleCondition, RULE_ID_BASE, RULE_ID_CAPACITY,
};

pub type Result<T> = std::result::Result<T, PolicyError>;
