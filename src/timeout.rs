//! Inactivity timeouts keyed by (client id, stream id).
//!
//! Drivers refresh their entry on every read, write and processed frame. A
//! background sweeper runs about once per second and fires the callback of
//! each expired entry exactly once, visiting entries in deadline order and
//! stopping at the first one still pending. The callback then closes the
//! client or resets the stream. Stream id 0 is the connection itself.
//!
//! Deadlines use `tokio::time::Instant`, so tests can drive expiry with a
//! paused clock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Callback run when an entry expires.
pub type OnTimeout = Box<dyn FnOnce() + Send + 'static>;

/// Period of the background sweep.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);

type Key = (u64, u32);

struct Entry {
    deadline: Instant,
    on_timeout: OnTimeout,
}

/// Entries by key, plus the same keys ordered by deadline. Both always hold
/// the same set of keys.
#[derive(Default)]
struct Entries {
    by_key: BTreeMap<Key, Entry>,
    by_deadline: BTreeSet<(Instant, Key)>,
}

impl Entries {
    fn insert(&mut self, key: Key, entry: Entry) {
        let deadline = entry.deadline;
        if let Some(old) = self.by_key.insert(key, entry) {
            self.by_deadline.remove(&(old.deadline, key));
        }
        self.by_deadline.insert((deadline, key));
    }

    fn remove(&mut self, key: Key) -> Option<Entry> {
        let entry = self.by_key.remove(&key)?;
        self.by_deadline.remove(&(entry.deadline, key));
        Some(entry)
    }

    fn postpone(&mut self, key: Key, deadline: Instant) -> bool {
        let Some(entry) = self.by_key.get_mut(&key) else {
            return false;
        };
        self.by_deadline.remove(&(entry.deadline, key));
        entry.deadline = deadline;
        self.by_deadline.insert((deadline, key));
        true
    }

    /// Pop the earliest entry if it is due at `now`.
    fn pop_expired(&mut self, now: Instant) -> Option<(Key, Entry)> {
        let &(deadline, key) = self.by_deadline.first()?;
        if deadline > now {
            return None;
        }
        self.by_deadline.remove(&(deadline, key));
        self.by_key.remove(&key).map(|entry| (key, entry))
    }
}

/// Shared timeout queue. Cloning is cheap and yields a handle to the same queue.
#[derive(Clone, Default)]
pub struct TimeoutQueue {
    entries: Arc<Mutex<Entries>>,
}

impl std::fmt::Debug for TimeoutQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // Callbacks run outside the lock, so a poisoned queue is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the entry for (client, stream).
    pub fn insert<F>(&self, client_id: u64, stream_id: u32, timeout: Duration, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let entry = Entry {
            deadline: Instant::now() + timeout,
            on_timeout: Box::new(on_timeout),
        };
        self.lock().insert((client_id, stream_id), entry);
    }

    /// Push the deadline of an existing entry out to `now + timeout`.
    /// Returns false if there is no such entry.
    pub fn update(&self, client_id: u64, stream_id: u32, timeout: Duration) -> bool {
        self.lock().postpone((client_id, stream_id), Instant::now() + timeout)
    }

    /// Remove the entry without firing it. Idempotent.
    pub fn remove(&self, client_id: u64, stream_id: u32) -> bool {
        self.lock().remove((client_id, stream_id)).is_some()
    }

    /// Remove every entry belonging to a client.
    pub fn remove_client(&self, client_id: u64) {
        let mut entries = self.lock();
        let keys: Vec<Key> = entries
            .by_key
            .range((client_id, 0)..=(client_id, u32::MAX))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            entries.remove(key);
        }
    }

    pub fn contains(&self, client_id: u64, stream_id: u32) -> bool {
        self.lock().by_key.contains_key(&(client_id, stream_id))
    }

    pub fn len(&self) -> usize {
        self.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire and remove every entry whose deadline is at or before `now`.
    /// Only expired entries are visited. Returns how many fired.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<_> = {
            let mut entries = self.lock();
            std::iter::from_fn(|| entries.pop_expired(now)).collect()
        };

        let fired = expired.len();
        for ((client_id, stream_id), entry) in expired {
            tracing::debug!(client_id, stream_id, "inactivity timeout");
            (entry.on_timeout)();
        }
        fired
    }

    /// Spawn the periodic sweeper. It stops on its own once every handle to
    /// the queue has been dropped.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Mutex<Entries>> = Arc::downgrade(&self.entries);
        tokio::spawn(async move {
            let mut tick = time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(entries) = weak.upgrade() else {
                    break;
                };
                TimeoutQueue { entries }.sweep(Instant::now());
            }
        })
    }
}
