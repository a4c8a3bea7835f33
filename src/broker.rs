use log::{debug, warn};
use replichat_store::chatstore::MessageRecord;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Fans committed messages out to online recipients.
///
/// One bounded FIFO queue per open subscription; `publish` is called from
/// the commit path and never blocks. A subscriber whose queue is full is
/// dropped — a client that slow should reconnect and refetch.
pub struct Broker {
    capacity: usize,
    next_id: AtomicU64,
    subs: Mutex<HashMap<String, Vec<Entry>>>,
}

struct Entry {
    id: u64,
    tx: mpsc::Sender<MessageRecord>,
}

/// Receiving side of one subscription. Unsubscribes on drop.
pub struct Subscription {
    broker: Arc<Broker>,
    user: String,
    id: u64,
    pub rx: mpsc::Receiver<MessageRecord>,
}

impl Broker {
    pub fn new(capacity: usize) -> Self {
        Broker {
            capacity,
            next_id: AtomicU64::new(1),
            subs: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(self: &Arc<Self>, user: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(user.to_string())
            .or_insert_with(Vec::new)
            .push(Entry { id, tx });
        debug!("subscription {} opened for {}", id, user);
        Subscription {
            broker: Arc::clone(self),
            user: user.to_string(),
            id,
            rx,
        }
    }

    /// Enqueues a committed message to every open subscription of its
    /// recipient, dropping subscribers that are full or gone.
    pub fn publish(&self, message: &MessageRecord) {
        let mut subs = self.lock();
        let entries = match subs.get_mut(&message.recipient) {
            Some(entries) => entries,
            None => return,
        };

        entries.retain(|entry| match entry.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "dropping subscription {} for {}: queue full",
                    entry.id, message.recipient
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if entries.is_empty() {
            subs.remove(&message.recipient);
        }
    }

    pub fn subscriber_count(&self, user: &str) -> usize {
        self.lock().get(user).map(Vec::len).unwrap_or(0)
    }

    fn unsubscribe(&self, user: &str, id: u64) {
        let mut subs = self.lock();
        if let Some(entries) = subs.get_mut(user) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                subs.remove(user);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.subs.lock().expect("broker lock poisoned")
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(&self.user, self.id);
        debug!("subscription {} closed for {}", self.id, self.user);
    }
}
