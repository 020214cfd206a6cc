//! Faye: event-driven session orchestration for a local voice assistant.
//!
//! A spoken wake word starts a round trip through an external agent that
//! ends in played audio; a chat bridge accepts remote commands on the side.
//!
//! # Architecture
//!
//! Everything hangs off one in-process event bus:
//! - **EventHub**: publish/subscribe with bounded history
//! - **RoundTripCoordinator**: per-turn watchdog with one bounded resend
//! - **ConversationSessionManager**: multi-turn sessions with TTL and
//!   capacity eviction and a role-tagged context view
//! - **CommandBridge**: idempotent execution of chat commands, whose results
//!   flow back onto the bus for the other two

pub mod bridge;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod faye_dirs;
pub mod profile;
pub mod roundtrip;

pub use bridge::{BatchReport, CommandBridge};
pub use config::FayeConfig;
pub use conversation::ConversationSessionManager;
pub use error::{BridgeError, Result};
pub use events::{Event, EventHub, EventKind};
pub use roundtrip::RoundTripCoordinator;
