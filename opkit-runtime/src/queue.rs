//! Delays and deduplicates work items, one slot per key.
//!
//! Each (informer, reconciler) pair owns one [`EventQueue`]. The queue keeps
//! at most one pending item per key: colliding submissions collapse via
//! [`Coalescible::coalesce`], keys handed to a worker are leased so nothing
//! else can run them, and follow-ups arriving behind a lease park until the
//! worker reports back.

use std::{collections::VecDeque, hash::Hash};

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};

/// Merging behavior for events that collide on one key.
pub trait Coalescible: Sized {
    /// Merge `newer` into `self`, producing the event to keep queued.
    fn coalesce(self, newer: Self) -> Self;

    /// Relative urgency. A follow-up parked behind a lease is dropped on
    /// terminal completion unless it outranks (or differs from) the event
    /// the worker just processed.
    fn priority(&self) -> u8;
}

/// A queued unit of work for one key.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedItem<E> {
    /// The pending, possibly coalesced, event.
    pub event: E,
    /// Consecutive failed attempts so far for this key.
    pub attempts: u32,
}

/// What to do with a leased key once its attempt has finished.
#[derive(Clone, Debug)]
pub enum Disposition {
    /// Terminal success: clear all queue state for the key (a parked
    /// follow-up survives if it still demands work, see [`Coalescible`]).
    Forget,
    /// Run again no earlier than `not_before`, carrying `attempts` forward.
    Requeue {
        /// Earliest next dispatch instant.
        not_before: Instant,
        /// The attempt counter to store on the requeued item.
        attempts: u32,
    },
}

struct Lease<E> {
    /// The event handed to the worker.
    event: E,
    /// Coalesced follow-ups that arrived while the lease was out.
    pending: Option<E>,
}

struct Inner<K, E> {
    /// Ready keys in first-seen order. Every entry has an item in `items`.
    ready: VecDeque<K>,
    /// Items for keys in `ready` or `delayed`.
    items: AHashMap<K, QueuedItem<E>>,
    /// Keys blocked until an instant. Also present in `items`, never in `ready`.
    delayed: AHashMap<K, Instant>,
    /// Keys currently handed out to workers.
    leased: AHashMap<K, Lease<E>>,
    shutdown: bool,
}

impl<K: Eq + Hash + Clone, E> Inner<K, E> {
    /// Move due delayed keys to the tail of the ready list.
    fn promote_due(&mut self, now: Instant) {
        let due: Vec<K> = self
            .delayed
            .iter()
            .filter(|(_, not_before)| **not_before <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.delayed.remove(&key);
            self.ready.push_back(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }
}

/// A per-key FIFO with dedup, delayed retry and shutdown.
pub struct EventQueue<K, E> {
    inner: Mutex<Inner<K, E>>,
    notify: Notify,
}

impl<K, E> Default for EventQueue<K, E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                items: AHashMap::new(),
                delayed: AHashMap::new(),
                leased: AHashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }
}

impl<K, E> EventQueue<K, E>
where
    K: Eq + Hash + Clone,
    E: Coalescible + Clone + PartialEq,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit an event for a key.
    ///
    /// Collides with any stored or leased state for the key rather than
    /// growing the queue; after [`EventQueue::shutdown`] submissions are
    /// dropped.
    pub fn add(&self, key: K, event: E) {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return;
        }
        if let Some(lease) = inner.leased.get_mut(&key) {
            lease.pending = Some(match lease.pending.take() {
                Some(parked) => parked.coalesce(event),
                None => event,
            });
            return;
        }
        if let Some(item) = inner.items.get_mut(&key) {
            // collapse in place; a delayed key keeps its deadline
            let stored = item.event.clone();
            item.event = stored.coalesce(event);
            return;
        }
        inner.items.insert(key.clone(), QueuedItem { event, attempts: 0 });
        inner.ready.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Wait for the next ready key and lease it.
    ///
    /// Returns `None` once the queue is shut down and nothing is left to
    /// hand out. A leased key will not be returned again until
    /// [`EventQueue::done`] is called for it.
    pub async fn get(&self) -> Option<(K, QueuedItem<E>)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking state so a wakeup between the check
            // and the await is not lost
            notified.as_mut().enable();

            let deadline = {
                let mut inner = self.inner.lock();
                inner.promote_due(Instant::now());
                if let Some(key) = inner.ready.pop_front() {
                    let item = inner
                        .items
                        .remove(&key)
                        .expect("ready key had no queued item");
                    inner.leased.insert(key.clone(), Lease {
                        event: item.event.clone(),
                        pending: None,
                    });
                    return Some((key, item));
                }
                if inner.shutdown {
                    return None;
                }
                inner.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = notified.as_mut() => {}
                        () = sleep_until(deadline) => {}
                    }
                }
                None => notified.as_mut().await,
            }
        }
    }

    /// Report the outcome for a leased key.
    pub fn done(&self, key: &K, disposition: Disposition) {
        let mut inner = self.inner.lock();
        let Some(lease) = inner.leased.remove(key) else {
            return;
        };
        match disposition {
            Disposition::Forget => {
                if let Some(parked) = lease.pending {
                    // identical or weaker follow-ups are satisfied by the
                    // attempt that just finished
                    if parked != lease.event && parked.priority() >= lease.event.priority() {
                        inner.items.insert(key.clone(), QueuedItem {
                            event: parked,
                            attempts: 0,
                        });
                        inner.ready.push_back(key.clone());
                        drop(inner);
                        self.notify.notify_one();
                    }
                }
            }
            Disposition::Requeue { not_before, attempts } => {
                let event = match lease.pending {
                    Some(parked) => lease.event.coalesce(parked),
                    None => lease.event,
                };
                inner.items.insert(key.clone(), QueuedItem { event, attempts });
                if not_before <= Instant::now() {
                    inner.ready.push_back(key.clone());
                } else {
                    inner.delayed.insert(key.clone(), not_before);
                }
                drop(inner);
                // wake a sleeping getter so it re-arms its deadline
                self.notify.notify_one();
            }
        }
    }

    /// Drop all state for a key, leased or not.
    pub fn forget(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.items.remove(key);
        inner.delayed.remove(key);
        inner.leased.remove(key);
        inner.ready.retain(|k| k != key);
    }

    /// Unblock all waiters; subsequent [`EventQueue::get`] calls drain what
    /// is left and then return `None`, and new submissions are dropped.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Whether any state (queued, delayed or leased) exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        let inner = self.inner.lock();
        inner.items.contains_key(key) || inner.leased.contains_key(key)
    }

    /// Number of keys with queued (non-leased) work.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether no queued (non-leased) work remains.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
