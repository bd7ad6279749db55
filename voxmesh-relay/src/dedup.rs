//! Signal deduplication
//!
//! The relay delivers at least once. Redelivered offers would otherwise be
//! answered twice and redelivered candidates applied twice.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use voxmesh_core::models::SignalId;

/// Expired entries are swept every this many inserts
const SWEEP_EVERY: usize = 256;

#[derive(Clone)]
pub struct SignalDeduplicator {
    /// Signal id -> expiry
    entries: Arc<DashMap<SignalId, Instant>>,
    dedup_window: Duration,
    inserts: Arc<AtomicUsize>,
}

impl SignalDeduplicator {
    /// `dedup_window` is how long a delivered id is remembered
    #[must_use]
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            dedup_window,
            inserts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// True the first time an id is seen within the window
    #[must_use]
    pub fn should_process(&self, id: &SignalId) -> bool {
        let now = Instant::now();

        if let Some(expires_at) = self.entries.get(id) {
            if *expires_at > now {
                return false;
            }
        }

        self.entries.insert(id.clone(), now + self.dedup_window);
        if self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.cleanup_expired();
        }
        true
    }

    fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_id, expires_at| *expires_at > now);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every id (for testing)
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window() {
        let dedup = SignalDeduplicator::new(Duration::from_secs(30));
        let id = SignalId::from("sig-1");

        assert!(dedup.should_process(&id));
        assert!(!dedup.should_process(&id));
        assert!(dedup.should_process(&SignalId::from("sig-2")));
        assert_eq!(dedup.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_again_after_window() {
        let dedup = SignalDeduplicator::new(Duration::from_secs(30));
        let id = SignalId::from("sig-1");

        assert!(dedup.should_process(&id));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(dedup.should_process(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_expired() {
        let dedup = SignalDeduplicator::new(Duration::from_secs(1));
        for i in 0..SWEEP_EVERY - 1 {
            assert!(dedup.should_process(&SignalId::from(format!("old-{i}"))));
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(dedup.should_process(&SignalId::from("fresh")));
        assert_eq!(dedup.len(), 1);
    }
}
