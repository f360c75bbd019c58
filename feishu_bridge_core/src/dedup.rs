use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::timing::DelayedAction;

pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(300);

/// Short-lived set of message ids that were already routed.
///
/// Every insertion schedules its own eviction, so memory is bounded by the
/// arrival rate times the TTL.
#[derive(Clone)]
pub struct DedupStore {
    inner: Arc<Mutex<DedupInner>>,
    ttl: Duration,
}

#[derive(Default)]
struct DedupInner {
    // message id -> generation of the insertion that owns the entry
    entries: HashMap<String, u64>,
    next_generation: u64,
}

impl DedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DedupInner::default())),
            ttl,
        }
    }

    /// Atomically records `message_id`. Returns `true` only for the first
    /// sighting within the TTL window.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn check_and_mark(&self, message_id: &str) -> bool {
        let generation = {
            let mut inner = lock(&self.inner);
            if inner.entries.contains_key(message_id) {
                return false;
            }
            let generation = inner.next_generation;
            inner.next_generation = inner.next_generation.wrapping_add(1);
            inner.entries.insert(message_id.to_string(), generation);
            generation
        };

        let weak: Weak<Mutex<DedupInner>> = Arc::downgrade(&self.inner);
        let id = message_id.to_string();
        // Detached: the eviction runs even though the handle is dropped here.
        let _ = DelayedAction::schedule(self.ttl, move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = lock(&inner);
                if inner.entries.get(&id) == Some(&generation) {
                    inner.entries.remove(&id);
                }
            }
        });

        true
    }

    pub fn contains(&self, message_id: &str) -> bool {
        lock(&self.inner).entries.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

fn lock(inner: &Mutex<DedupInner>) -> MutexGuard<'_, DedupInner> {
    // The map holds plain data; a panic elsewhere cannot leave it inconsistent.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_sighting_is_rejected() {
        let store = DedupStore::default();
        assert!(store.check_and_mark("om_1"));
        assert!(!store.check_and_mark("om_1"));
        assert!(store.check_and_mark("om_2"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = DedupStore::new(Duration::from_secs(300));
        assert!(store.check_and_mark("om_1"));

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(store.contains("om_1"));
        assert!(!store.check_and_mark("om_1"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(!store.contains("om_1"));
        assert!(store.is_empty());
        assert!(store.check_and_mark("om_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn each_entry_expires_independently() {
        let store = DedupStore::new(Duration::from_secs(60));
        store.check_and_mark("early");
        tokio::time::sleep(Duration::from_secs(30)).await;
        store.check_and_mark("late");

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(!store.contains("early"));
        assert!(store.contains("late"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn concurrent_marks_admit_exactly_one() {
        let store = DedupStore::default();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.check_and_mark("om_same") }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
