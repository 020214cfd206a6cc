//! In-process publish/subscribe hub with bounded history.

use crate::events::fields::{EventFields, EventKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Default number of events kept in [`EventHub::recent_events`].
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// A published event. Immutable once created by the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    timestamp: DateTime<Utc>,
    payload: Map<String, Value>,
}

impl Event {
    fn new(event_type: String, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_owned(), other);
                map
            }
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Raw event type as published.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Known event kind, if the type is one the bridge understands.
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event_type)
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Publish time in epoch milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        u64::try_from(self.timestamp.timestamp_millis()).unwrap_or(0)
    }

    #[must_use]
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Payload normalized into canonical fields.
    #[must_use]
    pub fn fields(&self) -> EventFields {
        EventFields::from_payload(&self.payload)
    }
}

/// Subscriber callback. Runs synchronously inside [`EventHub::publish`].
pub type Listener = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Receives subscriber failures so they never reach the publisher.
pub type ErrorHook = Arc<dyn Fn(&Event, &SubscriberFailure) + Send + Sync>;

/// A subscriber that failed while handling an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFailure {
    pub subscriber_id: u64,
    pub message: String,
    pub panicked: bool,
}

struct HubState {
    history: VecDeque<Arc<Event>>,
    subscribers: Vec<(u64, Listener)>,
    next_subscriber_id: u64,
    error_hook: ErrorHook,
}

struct HubShared {
    capacity: usize,
    state: Mutex<HubState>,
}

impl HubShared {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A panicking subscriber runs outside the lock, so poisoning can only
        // come from a panic in hub code itself; the state is still coherent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Publish/subscribe bus shared by every session consumer. Cheap to clone.
#[derive(Clone)]
pub struct EventHub {
    shared: Arc<HubShared>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("EventHub")
            .field("capacity", &self.shared.capacity)
            .field("history", &state.history.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl EventHub {
    /// Create a hub retaining the most recent `history_capacity` events.
    #[must_use]
    pub fn new(history_capacity: usize) -> Self {
        let capacity = history_capacity.max(1);
        Self {
            shared: Arc::new(HubShared {
                capacity,
                state: Mutex::new(HubState {
                    history: VecDeque::with_capacity(capacity),
                    subscribers: Vec::new(),
                    next_subscriber_id: 1,
                    error_hook: Arc::new(log_subscriber_failure),
                }),
            }),
        }
    }

    /// Replace the hook that receives subscriber failures.
    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(&Event, &SubscriberFailure) + Send + Sync + 'static,
    {
        self.shared.lock().error_hook = Arc::new(hook);
    }

    /// Publish an event and deliver it to a snapshot of current subscribers.
    ///
    /// Subscribers added while this event is being dispatched do not see it.
    /// Subscriber errors and panics go to the error hook; delivery continues.
    pub fn publish(&self, event_type: impl Into<String>, payload: Value) -> Arc<Event> {
        let event = Arc::new(Event::new(event_type.into(), payload));

        let (subscribers, hook) = {
            let mut state = self.shared.lock();
            state.history.push_back(Arc::clone(&event));
            while state.history.len() > self.shared.capacity {
                state.history.pop_front();
            }
            (state.subscribers.clone(), Arc::clone(&state.error_hook))
        };

        for (subscriber_id, listener) in subscribers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => SubscriberFailure {
                    subscriber_id,
                    message: format!("{err:#}"),
                    panicked: false,
                },
                Err(panic) => SubscriberFailure {
                    subscriber_id,
                    message: panic_message(panic.as_ref()),
                    panicked: true,
                },
            };
            hook(&event, &failure);
        }

        event
    }

    /// Publish a known event kind.
    pub fn emit(&self, kind: EventKind, payload: Value) -> Arc<Event> {
        self.publish(kind.as_str(), payload)
    }

    /// Register a subscriber. The returned handle removes it again.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut state = self.shared.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id = state.next_subscriber_id.wrapping_add(1);
        state.subscribers.push((id, Arc::new(listener)));
        Subscription {
            id,
            hub: Arc::downgrade(&self.shared),
        }
    }

    /// Snapshot of retained events, oldest first.
    #[must_use]
    pub fn recent_events(&self) -> Vec<Arc<Event>> {
        self.shared.lock().history.iter().cloned().collect()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    #[must_use]
    pub fn history_capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Handle returned by [`EventHub::subscribe`].
///
/// Dropping the handle keeps the subscriber registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    hub: Weak<HubShared>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(hub) = self.hub.upgrade() else {
            return false;
        };
        let mut state = hub.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|(id, _)| *id != self.id);
        state.subscribers.len() != before
    }
}

fn log_subscriber_failure(event: &Event, failure: &SubscriberFailure) {
    tracing::error!(
        event_type = event.event_type(),
        event_id = event.id(),
        subscriber = failure.subscriber_id,
        panicked = failure.panicked,
        "event subscriber failed: {}",
        failure.message
    );
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "subscriber panicked".to_owned()
    }
}
