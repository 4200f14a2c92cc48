//! Observer registry.
//!
//! Components publish lifecycle notifications (a queue entry was
//! dequeued, a lock was released, ...) through an [`EventHub`]. Listeners
//! are invoked in registration order and all of them run for every event:
//! a listener that fails is logged and skipped, it never keeps the others
//! from seeing the event.
//!
//! IMPORTANT DESIGN:
//! - emitting only needs `&self`, the hub lives behind an `Arc` in the
//!   owning component.
//! - no lock is held across `.await`: emission snapshots the listener list,
//!   releases the lock, then awaits the listeners.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures::future::{join_all, BoxFuture};
use parking_lot::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Listener signature (async).
pub type EventListener<E> = Arc<dyn Fn(E) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct ListenerEntry<E> {
    id: ListenerId,
    listener: EventListener<E>,
    once: bool,
}

impl<E> Clone for ListenerEntry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: self.listener.clone(),
            once: self.once,
        }
    }
}

/// Registry of async observers for events of type `E`.
pub struct EventHub<E> {
    listeners: RwLock<Vec<ListenerEntry<E>>>,
}

impl<E> Default for EventHub<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventHub<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener that sees every event.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(E) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.push(Arc::new(listener), false)
    }

    /// Register a listener that is removed after its first event.
    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(E) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.push(Arc::new(listener), true)
    }

    fn push(&self, listener: EventListener<E>, once: bool) -> ListenerId {
        let id = next_listener_id();
        self.listeners.write().push(ListenerEntry { id, listener, once });
        id
    }

    /// Remove a listener; `false` if it was not registered
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|e| e.id != id);
        before != listeners.len()
    }

    pub fn clear(&self) -> usize {
        let mut listeners = self.listeners.write();
        let removed = listeners.len();
        listeners.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `event` to every listener and wait for all of them.
    ///
    /// Returns how many listeners failed.
    pub async fn emit(&self, event: &E) -> usize {
        let snapshot = {
            let mut listeners = self.listeners.write();
            if listeners.is_empty() {
                return 0;
            }
            let snapshot = listeners.clone();
            // once-listeners leave before the await so concurrent emits
            // cannot deliver to them twice
            listeners.retain(|e| !e.once);
            snapshot
        };

        let calls = snapshot
            .iter()
            .map(|entry| (entry.listener)(event.clone()));
        let results = join_all(calls).await;

        let mut failures = 0;
        for (entry, result) in snapshot.iter().zip(results) {
            if let Err(err) = result {
                failures += 1;
                warn!(listener = ?entry.id, "event listener failed: {:#}", err);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn listeners_run_in_registration_order() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            hub.on(move |n| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(format!("{tag}:{n}"));
                    Ok(())
                }
                .boxed()
            });
        }

        hub.emit(&1).await;
        assert_eq!(*seen.lock(), vec!["first:1", "second:1", "third:1"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn failing_listener_does_not_block_others() {
        let hub = EventHub::<&'static str>::new();
        let delivered = Arc::new(AtomicU64::new(0));

        hub.on(|_| async { Err::<(), _>(anyhow::anyhow!("boom")) }.boxed());
        let counter = delivered.clone();
        hub.on(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });

        let failures = hub.emit(&"evt").await;
        assert_eq!(failures, 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(logs_contain("event listener failed"));
    }

    #[tokio::test]
    async fn once_listener_fires_a_single_time() {
        let hub = EventHub::<u8>::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        hub.once(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        });

        hub.emit(&1).await;
        hub.emit(&2).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn off_removes_listener() {
        let hub = EventHub::<u8>::new();
        let id = hub.on(|_| async { Ok(()) }.boxed());
        assert!(hub.off(id));
        assert!(!hub.off(id));
        assert_eq!(hub.emit(&0).await, 0);
    }
}
