//! Frame fan-out with scoped subscriptions.
//!
//! A [`Subscription`] only holds a weak reference to the observer set, so a
//! subscriber can outlive the source it subscribed to, and dropping the
//! subscription detaches it whichever side goes first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::trace;

use crate::audio::frame::AudioFrame;

pub type FrameObserver = Arc<dyn Fn(&Arc<AudioFrame>) + Send + Sync>;

pub type ObserverId = u64;

type ObserverMap = DashMap<ObserverId, FrameObserver>;

/// Cloning yields another handle to the same observer set.
#[derive(Clone)]
pub struct Observable {
    observers: Arc<ObserverMap>,
    next_id: Arc<AtomicU64>,
}

impl Observable {
    pub fn new() -> Self {
        Self {
            observers: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self, observer: FrameObserver) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, observer);
        trace!("Observer {} attached", id);
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Calls every observer with `frame`. Observers may subscribe or
    /// unsubscribe from inside the call.
    pub fn notify(&self, frame: &Arc<AudioFrame>) {
        let observers: Vec<FrameObserver> = self
            .observers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for observer in observers {
            observer(frame);
        }
    }
}

impl Default for Observable {
    fn default() -> Self {
        Self::new()
    }
}

/// Detaches its observer when dropped.
#[must_use = "dropping a Subscription detaches the observer"]
pub struct Subscription {
    id: ObserverId,
    observers: Weak<ObserverMap>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Whether the source still exists.
    pub fn is_attached(&self) -> bool {
        self.observers
            .upgrade()
            .is_some_and(|map| map.contains_key(&self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(&self.id);
            trace!("Observer {} detached", self.id);
        }
    }
}
