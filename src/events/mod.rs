//! In-process event bus and the canonical event shape.

pub mod fields;
pub mod hub;

pub use fields::{EventFields, EventKind};
pub use hub::{Event, EventHub, Listener, SubscriberFailure, Subscription};

/// Current epoch time in milliseconds.
#[must_use]
pub fn now_epoch_millis() -> u64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        Err(_) => 0,
    }
}
