use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::WhitelistConfig;

static SNOWFLAKE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{17,20}$").unwrap());

/// Accounts the engine never acts on. Owners are always whitelisted too.
#[derive(Debug, Clone, Default)]
pub struct Exemptions {
    whitelisted: HashSet<u64>,
    owners: HashSet<u64>,
}

/// Strips quotes/whitespace and checks the result looks like a snowflake.
pub fn clean_id(raw: &str) -> Option<u64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '"' | '\'' | '`'))
        .collect();
    if !SNOWFLAKE_RE.is_match(&cleaned) {
        return None;
    }
    cleaned.parse().ok()
}

fn collect(raw: &[String], what: &str) -> HashSet<u64> {
    let mut out = HashSet::new();
    for r in raw {
        match clean_id(r) {
            Some(id) => {
                out.insert(id);
            }
            None => tracing::warn!(entry = %r, list = what, "ignoring invalid id"),
        }
    }
    out
}

impl Exemptions {
    pub fn from_config(cfg: &WhitelistConfig) -> Self {
        let owners = collect(&cfg.owners, "owners");
        let mut whitelisted = collect(&cfg.users, "whitelist");
        whitelisted.extend(owners.iter().copied());
        tracing::info!(
            whitelisted = whitelisted.len(),
            owners = owners.len(),
            "exemptions loaded"
        );
        Self {
            whitelisted,
            owners,
        }
    }

    pub fn new(whitelisted: impl IntoIterator<Item = u64>, owners: impl IntoIterator<Item = u64>) -> Self {
        let owners: HashSet<u64> = owners.into_iter().collect();
        let mut whitelisted: HashSet<u64> = whitelisted.into_iter().collect();
        whitelisted.extend(owners.iter().copied());
        Self {
            whitelisted,
            owners,
        }
    }

    pub fn is_exempt(&self, user_id: u64) -> bool {
        self.whitelisted.contains(&user_id)
    }

    pub fn is_owner(&self, user_id: u64) -> bool {
        self.owners.contains(&user_id)
    }

    pub fn owners(&self) -> impl Iterator<Item = u64> + '_ {
        self.owners.iter().copied()
    }
}
