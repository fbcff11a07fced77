//! In-process state store for local development and tests
//!
//! Keys live in a `DashMap`, so each operation holds the entry's shard lock
//! for its whole read-modify-write and is atomic per key, matching the
//! guarantees the Redis backend gets from MULTI/EXEC.

use super::{Counter, StateStore, StoreError, StoreResult};
use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Data {
    Text(String),
    Counter(u64),
    /// Kept sorted ascending by score
    Sorted(Vec<(String, f64)>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<DateTime<Utc>>,
}

/// Injected failure mode, for exercising fallback policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None = 0,
    Unavailable = 1,
    Timeout = 2,
}

pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    fault: AtomicU8,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            fault: AtomicU8::new(Fault::None as u8),
        }
    }

    /// Make every subsequent call fail until cleared with `Fault::None`
    pub fn inject_fault(&self, fault: Fault) {
        self.fault.store(fault as u8, Ordering::Release);
    }

    /// Overwrite a text value in place, keeping its expiry (tamper simulation)
    #[cfg(test)]
    pub fn overwrite(&self, key: &str, value: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.data = Data::Text(value.to_string());
        }
    }

    /// Drop expired keys (call periodically)
    pub fn cleanup(&self) {
        let now = self.clock.now();
        self.entries.retain(|_, entry| !is_expired(entry, now));
    }

    fn check_fault(&self) -> StoreResult<()> {
        match self.fault.load(Ordering::Acquire) {
            1 => Err(StoreError::Unavailable("injected fault".to_string())),
            2 => Err(StoreError::Timeout(Duration::from_millis(150))),
            _ => Ok(()),
        }
    }

    fn expiry(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }

    /// Fetch a live entry, evicting it first if it has expired
    fn live(&self, key: &str) -> Option<Entry> {
        let now = self.clock.now();
        self.entries.remove_if(key, |_, entry| is_expired(entry, now));
        self.entries.get(key).map(|e| e.clone())
    }

    fn corrupt(key: &str, expected: &str) -> StoreError {
        StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("expected {}", expected),
        }
    }
}

fn is_expired(entry: &Entry, now: DateTime<Utc>) -> bool {
    entry.expires_at.map(|at| at <= now).unwrap_or(false)
}

fn insert_sorted(set: &mut Vec<(String, f64)>, member: &str, score: f64) {
    set.retain(|(m, _)| m != member);
    let pos = set
        .iter()
        .position(|(_, s)| *s > score)
        .unwrap_or(set.len());
    set.insert(pos, (member.to_string(), score));
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_fault()
    }

    async fn incr_with_expiry(&self, keys: &[(String, Duration)]) -> StoreResult<Vec<Counter>> {
        self.check_fault()?;
        let now = self.clock.now();
        let mut counters = Vec::with_capacity(keys.len());

        for (key, ttl) in keys {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                data: Data::Counter(0),
                expires_at: None,
            });

            if is_expired(&entry, now) || entry.expires_at.is_none() {
                entry.data = Data::Counter(0);
                entry.expires_at = self.expiry(*ttl);
            }

            let count = match &mut entry.data {
                Data::Counter(c) => {
                    *c += 1;
                    *c
                }
                _ => return Err(Self::corrupt(key, "counter")),
            };

            let ttl_secs = entry
                .expires_at
                .map(|at| (at - now).num_seconds().max(1) as u64)
                .unwrap_or_else(|| ttl.as_secs());

            counters.push(Counter { count, ttl_secs });
        }

        Ok(counters)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_fault()?;
        match self.live(key) {
            Some(Entry { data: Data::Text(value), .. }) => Ok(Some(value)),
            Some(Entry { data: Data::Counter(count), .. }) => Ok(Some(count.to_string())),
            Some(_) => Err(Self::corrupt(key, "string")),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_fault()?;
        self.entries.insert(
            key.to_string(),
            Entry {
                data: Data::Text(value.to_string()),
                expires_at: self.expiry(ttl),
            },
        );
        Ok(())
    }

    async fn replace_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_fault()?;
        let now = self.clock.now();
        self.entries.remove_if(key, |_, entry| is_expired(entry, now));
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.data = Data::Text(value.to_string());
                entry.expires_at = self.expiry(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.check_fault()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str, ttl: Duration) -> StoreResult<()> {
        self.check_fault()?;
        let now = self.clock.now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            data: Data::Sorted(Vec::new()),
            expires_at: None,
        });
        if is_expired(&entry, now) {
            entry.data = Data::Sorted(Vec::new());
        }
        match &mut entry.data {
            Data::Sorted(set) => insert_sorted(set, member, score),
            _ => return Err(Self::corrupt(key, "sorted set")),
        }
        entry.expires_at = self.expiry(ttl);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check_fault()?;
        if let Some(mut entry) = self.entries.get_mut(key) {
            if let Data::Sorted(set) = &mut entry.data {
                set.retain(|(m, _)| m != member);
            }
        }
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.check_fault()?;
        match self.live(key) {
            Some(Entry { data: Data::Sorted(set), .. }) => Ok(set
                .into_iter()
                .filter(|(_, score)| *score >= min && *score <= max)
                .collect()),
            Some(_) => Err(Self::corrupt(key, "sorted set")),
            None => Ok(Vec::new()),
        }
    }

    async fn window_push(
        &self,
        key: &str,
        score: f64,
        member: &str,
        window: Duration,
        max_len: usize,
    ) -> StoreResult<u64> {
        self.check_fault()?;
        let now = self.clock.now();
        let cutoff = score - window.as_millis() as f64;

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            data: Data::Sorted(Vec::new()),
            expires_at: None,
        });
        if is_expired(&entry, now) {
            entry.data = Data::Sorted(Vec::new());
        }

        let count = match &mut entry.data {
            Data::Sorted(set) => {
                set.retain(|(_, s)| *s > cutoff);
                insert_sorted(set, member, score);
                let keep = max_len.max(1);
                if set.len() > keep {
                    let excess = set.len() - keep;
                    set.drain(..excess);
                }
                set.len() as u64
            }
            _ => return Err(Self::corrupt(key, "sorted set")),
        };
        entry.expires_at = self.expiry(window);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_counter_expires_with_window() {
        let (clock, store) = store();
        let keys = vec![("rl:test".to_string(), Duration::from_secs(60))];

        for expected in 1..=3 {
            let counters = store.incr_with_expiry(&keys).await.unwrap();
            assert_eq!(counters[0].count, expected);
        }

        clock.advance(chrono::Duration::seconds(61));
        let counters = store.incr_with_expiry(&keys).await.unwrap();
        assert_eq!(counters[0].count, 1);
        assert_eq!(counters[0].ttl_secs, 60);
    }

    #[tokio::test]
    async fn test_set_ex_expires() {
        let (clock, store) = store();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_ex_requires_existing_key() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(10);
        assert!(!store.replace_ex("k", "v", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set_ex("k", "v1", ttl).await.unwrap();
        assert!(store.replace_ex("k", "v2", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));

        store.del("k").await.unwrap();
        assert!(!store.replace_ex("k", "v3", ttl).await.unwrap());

        store.set_ex("k", "v4", ttl).await.unwrap();
        clock.advance(chrono::Duration::seconds(10));
        assert!(!store.replace_ex("k", "v5", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_push_trims_and_caps() {
        let (_clock, store) = store();
        let window = Duration::from_secs(60);

        assert_eq!(store.window_push("w", 0.0, "a", window, 10).await.unwrap(), 1);
        assert_eq!(store.window_push("w", 30_000.0, "b", window, 10).await.unwrap(), 2);
        // "a" falls out of the 60s window
        assert_eq!(store.window_push("w", 61_000.0, "c", window, 10).await.unwrap(), 2);
        // Cap keeps only the newest two
        assert_eq!(store.window_push("w", 62_000.0, "d", window, 2).await.unwrap(), 2);

        let members: Vec<String> = store
            .zrange_by_score("w", f64::NEG_INFINITY, f64::INFINITY)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["c".to_string(), "d".to_string()]);
    }

    #[tokio::test]
    async fn test_zadd_orders_by_score() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(60);
        store.zadd("z", 3.0, "c", ttl).await.unwrap();
        store.zadd("z", 1.0, "a", ttl).await.unwrap();
        store.zadd("z", 2.0, "b", ttl).await.unwrap();
        store.zrem("z", "b").await.unwrap();

        let range = store.zrange_by_score("z", 0.0, 10.0).await.unwrap();
        assert_eq!(range, vec![("a".to_string(), 1.0), ("c".to_string(), 3.0)]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let (_clock, store) = store();
        store.inject_fault(Fault::Unavailable);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));

        store.inject_fault(Fault::Timeout);
        assert!(matches!(store.get("k").await, Err(StoreError::Timeout(_))));

        store.inject_fault(Fault::None);
        assert!(store.ping().await.is_ok());
    }
}
