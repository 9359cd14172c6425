//! Per-user traffic counters
//!
//! One `TrafficCounter` exists per node tag. Every admitted flow holds an
//! `Arc<TrafficStorage>` for its user and bumps it on each read/write, so the
//! hot path touches a single atomic and never the map.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Upload/download accumulators for a single user
#[derive(Debug, Default)]
pub struct TrafficStorage {
    /// Bytes received from the client (client -> remote)
    up: AtomicU64,
    /// Bytes sent to the client (remote -> client)
    down: AtomicU64,
}

impl TrafficStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Add upload bytes
    #[inline]
    pub fn add_up(&self, bytes: u64) {
        self.up.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add download bytes
    #[inline]
    pub fn add_down(&self, bytes: u64) {
        self.down.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn up(&self) -> u64 {
        self.up.load(Ordering::Relaxed)
    }

    pub fn down(&self) -> u64 {
        self.down.load(Ordering::Relaxed)
    }

    /// Current (upload, download)
    pub fn load(&self) -> (u64, u64) {
        (self.up(), self.down())
    }

    /// Swap both counters to zero and return what they held.
    ///
    /// Each swap is atomic on its own; bytes added between the two swaps land
    /// in the next period instead of being lost.
    pub fn take(&self) -> (u64, u64) {
        let up = self.up.swap(0, Ordering::AcqRel);
        let down = self.down.swap(0, Ordering::AcqRel);
        (up, down)
    }
}

/// Traffic counters of one node, keyed by user uuid
#[derive(Debug, Default)]
pub struct TrafficCounter {
    counters: DashMap<String, Arc<TrafficStorage>>,
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the storage for a user
    pub fn get_counter(&self, uuid: &str) -> Arc<TrafficStorage> {
        if let Some(storage) = self.counters.get(uuid) {
            return Arc::clone(storage.value());
        }
        self.counters
            .entry(uuid.to_string())
            .or_insert_with(|| Arc::new(TrafficStorage::new()))
            .clone()
    }

    pub fn up_count(&self, uuid: &str) -> u64 {
        self.counters.get(uuid).map(|s| s.up()).unwrap_or(0)
    }

    pub fn down_count(&self, uuid: &str) -> u64 {
        self.counters.get(uuid).map(|s| s.down()).unwrap_or(0)
    }

    /// Zero a user's counters, keeping the entry. Returns what they held.
    pub fn reset(&self, uuid: &str) -> (u64, u64) {
        self.counters
            .get(uuid)
            .map(|storage| storage.take())
            .unwrap_or((0, 0))
    }

    /// Drop a user's entry. Flows still holding the storage keep counting
    /// into a detached instance that is never reported.
    pub fn delete(&self, uuid: &str) {
        self.counters.remove(uuid);
    }

    /// Snapshot of all (uuid, storage) pairs.
    ///
    /// Keys are collected first so callers can mutate the map while walking
    /// the result without holding shard locks.
    pub fn entries(&self) -> Vec<(String, Arc<TrafficStorage>)> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_add_and_load() {
        let storage = TrafficStorage::new();
        storage.add_up(100);
        storage.add_down(200);
        storage.add_up(50);
        assert_eq!(storage.load(), (150, 200));
    }

    #[test]
    fn test_storage_take_zeroes() {
        let storage = TrafficStorage::new();
        storage.add_up(10);
        storage.add_down(20);
        assert_eq!(storage.take(), (10, 20));
        assert_eq!(storage.load(), (0, 0));
    }

    #[test]
    fn test_counter_shares_storage_per_user() {
        let counter = TrafficCounter::new();
        let a = counter.get_counter("uuid-1");
        let b = counter.get_counter("uuid-1");
        a.add_up(5);
        b.add_up(7);
        assert_eq!(counter.up_count("uuid-1"), 12);
        assert_eq!(counter.len(), 1);
    }

    #[test]
    fn test_counter_reset_and_delete() {
        let counter = TrafficCounter::new();
        counter.get_counter("uuid-1").add_down(300);
        assert_eq!(counter.reset("uuid-1"), (0, 300));
        assert_eq!(counter.down_count("uuid-1"), 0);
        assert_eq!(counter.reset("uuid-missing"), (0, 0));
        assert_eq!(counter.len(), 1);

        counter.delete("uuid-1");
        assert!(counter.is_empty());
        assert_eq!(counter.down_count("uuid-1"), 0);
    }

    #[test]
    fn test_counter_concurrent_increments() {
        use std::thread;

        let counter = Arc::new(TrafficCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let c = Arc::clone(&counter);
                thread::spawn(move || {
                    let key = format!("uuid-{}", i % 2);
                    for _ in 0..1000 {
                        let storage = c.get_counter(&key);
                        storage.add_up(1);
                        storage.add_down(2);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.len(), 2);
        let total_up: u64 = counter.entries().iter().map(|(_, s)| s.up()).sum();
        let total_down: u64 = counter.entries().iter().map(|(_, s)| s.down()).sum();
        assert_eq!(total_up, 8000);
        assert_eq!(total_down, 16000);
    }

    #[test]
    fn test_take_while_writing_loses_nothing() {
        use std::thread;

        let storage = Arc::new(TrafficStorage::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&storage);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        s.add_up(1);
                    }
                })
            })
            .collect();

        let s = Arc::clone(&storage);
        let taker = thread::spawn(move || {
            let mut taken = 0u64;
            for _ in 0..10 {
                thread::sleep(std::time::Duration::from_millis(1));
                taken += s.take().0;
            }
            taken
        });

        for h in writers {
            h.join().unwrap();
        }
        let taken = taker.join().unwrap();
        assert_eq!(taken + storage.take().0, 4000);
    }
}
