//! Tracks the subscriptions made through the public facade so they can be
//! removed in bulk.
//!
//! Subscriptions made directly on the [`Bus`] (such as the reset coordinator's own
//! listener) are not tracked and survive [`Registry::remove_all`].
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
};

use tracing::debug;

use crate::{
    bus::{Bus, SubscriptionHandle},
    event::{Event, Payload},
};

type Handles = HashMap<Event, Vec<SubscriptionHandle>>;
type Tracked = Arc<Mutex<Handles>>;

/// Listener bookkeeping layered over a [`Bus`].
#[derive(Clone, Debug)]
pub struct Registry {
    bus: Bus,
    tracked: Tracked,
}

fn lock(tracked: &Tracked) -> MutexGuard<'_, Handles> {
    tracked
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn untrack(tracked: &mut Handles, handle: &SubscriptionHandle) {
    if let Some(handles) = tracked.get_mut(handle.event()) {
        handles.retain(|other| other != handle);
        if handles.is_empty() {
            tracked.remove(handle.event());
        }
    }
}

impl Registry {
    /// Creates a registry publishing through `bus`.
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            tracked: Arc::default(),
        }
    }

    /// The bus this registry subscribes on.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    fn track(&self, handle: SubscriptionHandle) {
        lock(&self.tracked)
            .entry(handle.event().clone())
            .or_default()
            .push(handle);
    }

    /// Subscribes `handler` to `event` and tracks the subscription.
    pub fn on<F>(&self, event: Event, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let handle = self.bus.subscribe(event, handler);
        self.track(handle.clone());
        handle
    }

    /// Subscribes `handler` to the next publish of `event`.
    ///
    /// The subscription untracks itself before `handler` runs, so a handler that
    /// calls [`Registry::remove_all`] never sees its own entry.
    pub fn once<F>(&self, event: Event, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        let own: Arc<OnceLock<SubscriptionHandle>> = Arc::new(OnceLock::new());
        let slot = Arc::clone(&own);
        let tracked = Arc::clone(&self.tracked);

        // The tracked lock is held until the handle is recorded; a publish from
        // another thread in the meantime waits for it before untracking.
        let mut guard = lock(&self.tracked);
        let handle = self.bus.subscribe_once(event, move |payload| {
            {
                let mut tracked = lock(&tracked);
                if let Some(handle) = slot.get() {
                    debug!("once({}) fired", handle.event());
                    untrack(&mut tracked, handle);
                }
            }
            handler(payload);
        });

        let _ = own.set(handle.clone());
        guard
            .entry(handle.event().clone())
            .or_default()
            .push(handle.clone());
        handle
    }

    /// Removes every tracked subscription for `event`, or for all events when
    /// `event` is `None`. Returns how many subscriptions were removed.
    pub fn remove_all(&self, event: Option<&Event>) -> usize {
        let snapshot: Vec<SubscriptionHandle> = {
            let mut tracked = lock(&self.tracked);
            match event {
                Some(event) => tracked.remove(event).unwrap_or_default(),
                None => tracked.drain().flat_map(|(_, handles)| handles).collect(),
            }
        };

        let removed = snapshot
            .iter()
            .filter(|handle| self.bus.unsubscribe(handle))
            .count();

        match event {
            Some(event) => debug!("Removed {removed} listener(s) for '{event}'"),
            None => debug!("Removed {removed} listener(s)"),
        }
        removed
    }

    /// Number of tracked subscriptions for `event`.
    pub fn tracked_count(&self, event: &Event) -> usize {
        lock(&self.tracked).get(event).map_or(0, Vec::len)
    }

    /// Total number of tracked subscriptions across all events.
    pub fn total_tracked(&self) -> usize {
        lock(&self.tracked).values().map(Vec::len).sum()
    }
}
