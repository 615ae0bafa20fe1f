use std::sync::atomic::{AtomicU64, Ordering};

/// Broker-wide counters. Cheap to bump from any task; read via [`snapshot`].
///
/// [`snapshot`]: BrokerStats::snapshot
#[derive(Debug, Default)]
pub struct BrokerStats {
    produced: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    marked: AtomicU64,
    committed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl BrokerStats {
    pub fn produced(&self, n: u64) {
        self.produced.fetch_add(n, Ordering::Relaxed);
    }

    pub fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn redelivered(&self) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn marked(&self, n: u64) {
        self.marked.fetch_add(n, Ordering::Relaxed);
    }

    pub fn committed(&self, n: u64) {
        self.committed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dead_lettered(&self, n: u64) {
        self.dead_lettered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            produced: self.produced.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            marked: self.marked.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub produced: u64,
    pub delivered: u64,
    pub redelivered: u64,
    pub marked: u64,
    pub committed: u64,
    pub dead_lettered: u64,
}
