//! Read-only projection of a session for front-ends.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use serde::Serialize;
use shared::{
    domain::PatchConfig,
    session::{InstallResult, LogLine, Phase},
};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub phase: Phase,
    pub config: Option<PatchConfig>,
    pub log_lines: Vec<LogLine>,
    pub install: Option<InstallResult>,
}

impl SessionSnapshot {
    pub fn selecting(session_id: Uuid) -> Self {
        Self {
            session_id,
            phase: Phase::Selecting,
            config: None,
            log_lines: Vec::new(),
            install: None,
        }
    }
}

type Observer = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

struct Entry {
    observer: Observer,
    /// Revision this observer was last handed.
    seen: Option<u64>,
}

#[derive(Default)]
struct Observers {
    entries: BTreeMap<u64, Entry>,
    revision: u64,
}

impl Observers {
    fn has_pending(&self) -> bool {
        self.entries
            .values()
            .any(|entry| entry.seen != Some(self.revision))
    }
}

pub struct ObserverRegistry {
    observers: Mutex<Observers>,
    next_id: AtomicU64,
    delivering: AtomicBool,
    latest: watch::Sender<SessionSnapshot>,
}

impl ObserverRegistry {
    pub fn new(initial: SessionSnapshot) -> Arc<Self> {
        let (latest, _) = watch::channel(initial);
        Arc::new(Self {
            observers: Mutex::new(Observers::default()),
            next_id: AtomicU64::new(1),
            delivering: AtomicBool::new(false),
            latest,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `observer` and replays the current snapshot to it. The
    /// replay runs before this returns unless another thread is delivering,
    /// in which case that thread hands it over. Dropping the returned handle
    /// detaches the observer.
    pub fn subscribe<F>(self: &Arc<Self>, observer: F) -> Subscription
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().entries.insert(
            id,
            Entry {
                observer: Arc::new(observer),
                seen: None,
            },
        );
        self.deliver();

        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub fn latest(&self) -> SessionSnapshot {
        self.latest.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.latest.subscribe()
    }

    pub fn stream(&self) -> WatchStream<SessionSnapshot> {
        WatchStream::new(self.latest.subscribe())
    }

    pub fn observer_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Makes `snapshot` current without calling observers. Callers that
    /// hold their own state lock store under it, so snapshots land in the
    /// order the state changed.
    pub(crate) fn store(&self, snapshot: SessionSnapshot) {
        let mut observers = self.lock();
        self.latest.send_replace(snapshot);
        observers.revision += 1;
    }

    /// Hands the current snapshot to every observer that has not seen it.
    /// One thread delivers at a time; stores made meanwhile (from other
    /// threads or from inside an observer) are picked up by that thread, so
    /// no observer ever receives an older snapshot after a newer one.
    pub(crate) fn deliver(&self) {
        loop {
            if self
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _flag = DeliveryFlag(&self.delivering);
                while let Some((snapshot, due)) = self.take_pending() {
                    for observer in due {
                        observer(&snapshot);
                    }
                }
            }
            // A store that raced the flag release found it still set.
            if !self.lock().has_pending() {
                return;
            }
        }
    }

    fn take_pending(&self) -> Option<(SessionSnapshot, Vec<Observer>)> {
        let mut observers = self.lock();
        let revision = observers.revision;
        let due: Vec<Observer> = observers
            .entries
            .values_mut()
            .filter(|entry| entry.seen != Some(revision))
            .map(|entry| {
                entry.seen = Some(revision);
                Arc::clone(&entry.observer)
            })
            .collect();
        if due.is_empty() {
            return None;
        }
        Some((self.latest.borrow().clone(), due))
    }

    fn remove(&self, id: u64) {
        self.lock().entries.remove(&id);
    }
}

struct DeliveryFlag<'a>(&'a AtomicBool);

impl Drop for DeliveryFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[must_use = "dropping a Subscription detaches the observer"]
pub struct Subscription {
    id: u64,
    registry: Weak<ObserverRegistry>,
}

impl Subscription {
    pub fn is_attached(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| {
                registry.lock().entries.contains_key(&self.id)
            })
            .unwrap_or(false)
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[cfg(test)]
#[path = "tests/bridge_tests.rs"]
mod tests;
