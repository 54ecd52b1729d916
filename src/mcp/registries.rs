//! Shared concurrency primitives used by the engine and the transports.
//!
//! The engine keeps its per-connection state in small guarded maps; the
//! locks are only ever held for the duration of a map operation, never
//! across an await point. Teardown paths take a snapshot (or drain the map
//! wholesale) and iterate outside the lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;

/// A map behind a reader-writer lock with the operations the engine needs:
/// get, set, remove, clear, and snapshot/drain for iteration-under-teardown.
#[derive(Debug)]
pub struct SharedMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for SharedMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SharedMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by key.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().expect("registry lock poisoned").get(key).cloned()
    }

    /// Insert or replace a value, returning the previous one.
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .insert(key, value)
    }

    /// Remove a value by key, returning it.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .remove(key)
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.write().expect("registry lock poisoned").clear();
    }

    /// A defensive copy of all entries, safe to iterate during teardown.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Atomically swap the map to empty and return the captured entries.
    pub fn drain(&self) -> Vec<(K, V)> {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        std::mem::take(&mut *guard).into_iter().collect()
    }
}

/// A one-shot cancellation token.
///
/// The first `cancel` wins; later calls are no-ops. Waiters blocked in
/// [`CancelToken::cancelled`] wake exactly once.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
    reason: Mutex<Option<String>>,
}

impl CancelToken {
    /// Create a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation with a reason. Only the first call takes effect.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.inner.reason.lock().expect("cancel reason lock poisoned") = Some(reason.into());
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The reason passed to the first `cancel`, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .expect("cancel reason lock poisoned")
            .clone()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent cancel
        // cannot slip between the check and the await.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shared_map_basics() {
        let map: SharedMap<i64, String> = SharedMap::new();
        assert!(map.set(1, "a".into()).is_none());
        assert_eq!(map.set(1, "b".into()), Some("a".into()));
        assert_eq!(map.get(&1), Some("b".into()));
        assert!(map.contains(&1));
        assert_eq!(map.remove(&1), Some("b".into()));
        assert!(map.remove(&1).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_shared_map_drain_is_atomic() {
        let map: SharedMap<i64, i64> = SharedMap::new();
        map.set(1, 10);
        map.set(2, 20);
        let drained = map.drain();
        assert_eq!(drained.len(), 2);
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.reason()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("done");
        let reason = handle.await.unwrap();
        assert_eq!(reason.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_cancel_token_first_reason_wins() {
        let token = CancelToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
        // Waiting after cancellation returns immediately.
        token.cancelled().await;
    }
}
