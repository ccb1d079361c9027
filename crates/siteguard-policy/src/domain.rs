//! Domain validation

use std::collections::BTreeSet;

pub const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Check a bare, already-lowercased host name.
///
/// Rejects anything carrying a scheme, port, path, or wildcard, single-label
/// names, and labels that are empty, too long, or start/end with a hyphen.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

/// Trim and lowercase `input`, returning it only if it is a valid domain.
pub fn normalize_domain(input: &str) -> Option<String> {
    let domain = input.trim().to_lowercase();
    is_valid_domain(&domain).then_some(domain)
}

/// Canonical persisted form of a blocklist: trimmed, lowercase, deduplicated
/// and sorted. Malformed entries are kept so the reconciler can demote them.
pub fn normalize_list<I, S>(domains: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    domains
        .into_iter()
        .map(|d| d.as_ref().trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
