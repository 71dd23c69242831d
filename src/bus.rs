//! Publish/subscribe bus connecting the supervisor's components.
//!
//! Every component receives a clone of the same [`Bus`] handle. Handlers run
//! synchronously on the publishing thread, in the order they were registered. The
//! internal lock only guards the subscription lists and is released before any
//! handler runs, so handlers are free to publish, subscribe or unsubscribe.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::trace;

use crate::event::{Event, Payload};

/// Callback invoked for each publish of the event it is subscribed to.
pub type Handler = Arc<dyn Fn(&Payload) + Send + Sync + 'static>;

/// Identifier assigned to a subscription by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Handle returned by [`Bus::subscribe`], used to remove that subscription later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    event: Event,
    id: SubscriptionId,
}

impl SubscriptionHandle {
    /// Event the subscription listens to.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Identifier of the subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    once: bool,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscriptions: HashMap<Event, Vec<Subscription>>,
}

/// Cloneable handle to a shared publish/subscribe channel.
#[derive(Clone, Default)]
pub struct Bus {
    state: Arc<Mutex<BusState>>,
}

impl Bus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `handler` for every future publish of `event`.
    pub fn subscribe<F>(&self, event: Event, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.insert(event, Arc::new(handler), false)
    }

    /// Registers `handler` for the next publish of `event` only.
    ///
    /// The subscription is dropped from the bus before the handler runs.
    pub fn subscribe_once<F>(&self, event: Event, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.insert(event, Arc::new(handler), true)
    }

    fn insert(&self, event: Event, handler: Handler, once: bool) -> SubscriptionHandle {
        let mut state = self.state();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state
            .subscriptions
            .entry(event.clone())
            .or_default()
            .push(Subscription { id, handler, once });
        SubscriptionHandle { event, id }
    }

    /// Invokes every handler registered for `event` at the time of the call.
    ///
    /// Returns the number of handlers invoked. Publishing an event nobody listens
    /// to is not an error.
    pub fn publish(&self, event: &Event, payload: Payload) -> usize {
        let handlers: Vec<Handler> = {
            let mut state = self.state();
            let Some(subscriptions) = state.subscriptions.get_mut(event) else {
                trace!("No subscribers for '{event}'");
                return 0;
            };

            let snapshot = subscriptions
                .iter()
                .map(|subscription| Arc::clone(&subscription.handler))
                .collect();
            subscriptions.retain(|subscription| !subscription.once);
            let drained = subscriptions.is_empty();
            if drained {
                state.subscriptions.remove(event);
            }
            snapshot
        };

        trace!("Publishing '{event}' to {} handler(s)", handlers.len());
        for handler in &handlers {
            handler(&payload);
        }
        handlers.len()
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut state = self.state();
        let Some(subscriptions) = state.subscriptions.get_mut(&handle.event) else {
            return false;
        };

        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != handle.id);
        let removed = subscriptions.len() != before;
        let drained = subscriptions.is_empty();
        if drained {
            state.subscriptions.remove(&handle.event);
        }
        removed
    }

    /// Number of handlers currently registered for `event`.
    pub fn listener_count(&self, event: &Event) -> usize {
        self.state()
            .subscriptions
            .get(event)
            .map_or(0, |subscriptions| subscriptions.len())
    }

    /// Drops every subscription on the bus.
    pub fn clear(&self) {
        self.state().subscriptions.clear();
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        let mut counts: Vec<(String, usize)> = state
            .subscriptions
            .iter()
            .map(|(event, subscriptions)| (event.to_string(), subscriptions.len()))
            .collect();
        counts.sort();
        f.debug_struct("Bus").field("subscriptions", &counts).finish()
    }
}
