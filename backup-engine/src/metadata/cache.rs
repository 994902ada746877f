//! Point-lookup cache for metadata records.
//!
//! The cache is owned by the store that uses it and is injected, so tests can
//! drive expiry with a [`ManualClock`].

use super::BackupMetadata;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};

/// Source of "now" for TTL and retention decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub trait MetadataCache: Send + Sync {
    fn get(&self, id: &str) -> Option<BackupMetadata>;
    fn put(&self, record: BackupMetadata);
    fn remove(&self, id: &str);
}

struct CacheEntry {
    record: BackupMetadata,
    inserted_at: DateTime<Utc>,
}

/// TTL cache with a bounded entry count; evicts the oldest insert when full.
pub struct TtlCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl TtlCache {
    pub fn new(ttl: std::time::Duration, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::MAX),
            max_entries: max_entries.max(1),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl MetadataCache for TtlCache {
    fn get(&self, id: &str) -> Option<BackupMetadata> {
        let now = self.clock.now();
        {
            let entry = self.entries.get(id)?;
            if now - entry.inserted_at < self.ttl {
                return Some(entry.record.clone());
            }
        }
        // The read guard is released above; removing while holding it would deadlock.
        self.entries.remove(id);
        None
    }

    fn put(&self, record: BackupMetadata) {
        if !self.entries.contains_key(&record.id) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        let inserted_at = self.clock.now();
        self.entries
            .insert(record.id.clone(), CacheEntry { record, inserted_at });
    }

    fn remove(&self, id: &str) {
        self.entries.remove(id);
    }
}
