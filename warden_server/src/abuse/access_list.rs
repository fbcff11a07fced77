//! Static allow/deny lists for rate limiting
//!
//! Entries are exact IPs or user ids; an entry ending in `*` matches by
//! prefix (e.g. `10.20.*`). The blacklist always wins over the whitelist.

use std::collections::HashSet;

/// Result of an access list lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCheck {
    /// Not listed, run the normal checks
    Neutral,
    /// Bypass every check
    Whitelisted(String),
    /// Deny unconditionally
    Blacklisted(BlockReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// IP matches a blacklist entry
    ListedIp(String),
    /// User id matches a blacklist entry
    ListedUser(String),
}

impl BlockReason {
    pub fn message(&self) -> String {
        match self {
            BlockReason::ListedIp(entry) => format!("IP matches blacklist entry '{}'", entry),
            BlockReason::ListedUser(entry) => format!("User matches blacklist entry '{}'", entry),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessList {
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl AccessList {
    pub fn new(whitelist: &HashSet<String>, blacklist: &HashSet<String>) -> Self {
        Self {
            whitelist: normalize(whitelist),
            blacklist: normalize(blacklist),
        }
    }

    /// Check an IP and optional user id against both lists
    pub fn check(&self, ip: &str, user_id: Option<&str>) -> AccessCheck {
        if let Some(entry) = find(&self.blacklist, ip) {
            return AccessCheck::Blacklisted(BlockReason::ListedIp(entry.to_string()));
        }
        if let Some(user) = user_id {
            if let Some(entry) = find(&self.blacklist, user) {
                return AccessCheck::Blacklisted(BlockReason::ListedUser(entry.to_string()));
            }
        }

        let whitelisted = find(&self.whitelist, ip)
            .or_else(|| user_id.and_then(|user| find(&self.whitelist, user)));
        match whitelisted {
            Some(entry) => AccessCheck::Whitelisted(entry.to_string()),
            None => AccessCheck::Neutral,
        }
    }
}

fn normalize(entries: &HashSet<String>) -> Vec<String> {
    let mut list: Vec<String> = entries
        .iter()
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty() && e != "*")
        .collect();
    list.sort();
    list
}

fn find<'a>(list: &'a [String], value: &str) -> Option<&'a str> {
    let value = value.to_lowercase();
    list.iter()
        .find(|entry| match entry.strip_suffix('*') {
            Some(prefix) => value.starts_with(prefix),
            None => **entry == value,
        })
        .map(String::as_str)
}
