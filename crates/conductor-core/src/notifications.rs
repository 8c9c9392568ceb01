use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const INDEX_COMPLETED: &str = "indexCompleted";

pub fn index_completed(job: &str) -> Value {
    json!({ "message": INDEX_COMPLETED, "job": job })
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Value>>>,
}

/// Best-effort fan-out of JSON payloads to every live subscriber. Each
/// subscriber owns an unbounded queue, so a slow reader never blocks `notify`.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.insert(id, sender);
        }
        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Queues `payload` for every subscriber and returns how many received it.
    pub fn notify(&self, payload: Value) -> usize {
        let Ok(mut subscribers) = self.inner.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|_, sender| sender.send(payload.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<Value>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade()
            && let Ok(mut subscribers) = inner.subscribers.lock()
        {
            subscribers.remove(&self.id);
        }
    }
}
