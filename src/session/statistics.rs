use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle counters. Session counters also feed their factory's counters.
#[derive(Debug, Default)]
pub struct Statistics {
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    loads: AtomicU64,
    cache_hits: AtomicU64,
    flushes: AtomicU64,
    parent: Option<Arc<Statistics>>,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    /// Entities read from the database.
    pub loads: u64,
    /// Loads answered by the persistence context.
    pub cache_hits: u64,
    pub flushes: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_of(parent: Arc<Statistics>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    fn bump(&self, select: fn(&Statistics) -> &AtomicU64) {
        select(self).fetch_add(1, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.bump(select);
        }
    }

    pub fn record_insert(&self) {
        self.bump(|s| &s.inserts);
    }

    pub fn record_update(&self) {
        self.bump(|s| &s.updates);
    }

    pub fn record_delete(&self) {
        self.bump(|s| &s.deletes);
    }

    pub fn record_load(&self) {
        self.bump(|s| &s.loads);
    }

    pub fn record_cache_hit(&self) {
        self.bump(|s| &s.cache_hits);
    }

    pub fn record_flush(&self) {
        self.bump(|s| &s.flushes);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} inserts, {} updates, {} deletes, {} loads ({} cache hits), {} flushes",
            self.inserts, self.updates, self.deletes, self.loads, self.cache_hits, self.flushes
        )
    }
}
