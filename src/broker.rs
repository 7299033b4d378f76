use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

use crate::event::Event;
use crate::filter::Filter;

pub type SubscriberId = u64;

/// Handle returned from `subscribe()`. Drop it (or let the channel close)
/// to tear the subscription down.
pub struct LiveHandle {
    pub id: SubscriberId,
    pub rx: Receiver<Vec<u8>>,
}

struct Subscriber {
    id: SubscriberId,
    filter: Filter,
    sender: Sender<Vec<u8>>,
    /// Set the first time `try_send` sees the channel full; cleared on the
    /// next successful send. A subscriber still full after `write_timeout`
    /// has elapsed since this was set is evicted (spec §4.4, §5).
    full_since: Option<Instant>,
}

/// Live pub/sub fan-out (spec §4.4).
///
/// Subscription membership is read-mostly: `dispatch` takes a read lock,
/// `subscribe`/`unsubscribe` take a write lock. Zero-cost when there are no
/// subscribers — `subscriber_count` is checked before any lock is taken.
pub struct Broker {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    subscriber_count: AtomicU64,
    write_timeout: Duration,
}

impl Broker {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            subscriber_count: AtomicU64::new(0),
            write_timeout,
        }
    }

    #[inline]
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count.load(Ordering::Relaxed) > 0
    }

    pub fn subscribe(&self, filter: Filter, buffer: usize) -> LiveHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer);

        let sub = Subscriber { id, filter, sender: tx, full_since: None };
        self.subscribers.write().unwrap().push(sub);
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);

        LiveHandle { id, rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut subs = self.subscribers.write().unwrap();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = before - subs.len();
        if removed > 0 {
            self.subscriber_count.fetch_sub(removed as u64, Ordering::Relaxed);
        }
    }

    /// Evaluate every subscriber's filter against `event` and enqueue the
    /// serialized bytes for matches. Never blocks: a subscriber whose
    /// buffer stays full past the write timeout is evicted instead.
    pub fn dispatch(&self, event: &Event) {
        if !self.has_subscribers() {
            return;
        }

        let serialized = event.serialize();
        let now = Instant::now();
        let mut dead: Vec<SubscriberId> = Vec::new();
        let mut newly_full: Vec<SubscriberId> = Vec::new();
        let mut recovered: Vec<SubscriberId> = Vec::new();

        {
            let subs = self.subscribers.read().unwrap();
            for sub in subs.iter() {
                if !sub.filter.matches(event) {
                    continue;
                }
                match sub.sender.try_send(serialized.clone()) {
                    Ok(()) => {
                        if sub.full_since.is_some() {
                            recovered.push(sub.id);
                        }
                    }
                    Err(TrySendError::Closed(_)) => dead.push(sub.id),
                    Err(TrySendError::Full(_)) => {
                        let stale = sub
                            .full_since
                            .map(|since| now.duration_since(since) >= self.write_timeout)
                            .unwrap_or(false);
                        if stale {
                            dead.push(sub.id);
                        } else if sub.full_since.is_none() {
                            newly_full.push(sub.id);
                        }
                    }
                }
            }
        }

        if !dead.is_empty() || !newly_full.is_empty() || !recovered.is_empty() {
            let mut subs = self.subscribers.write().unwrap();
            for sub in subs.iter_mut() {
                if newly_full.contains(&sub.id) {
                    sub.full_since = Some(now);
                } else if recovered.contains(&sub.id) {
                    sub.full_since = None;
                }
            }
            if !dead.is_empty() {
                let before = subs.len();
                subs.retain(|s| !dead.contains(&s.id));
                let removed = before - subs.len();
                if removed > 0 {
                    self.subscriber_count.fetch_sub(removed as u64, Ordering::Relaxed);
                }
            }
        }
    }
}
