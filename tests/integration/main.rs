//! Integration test binary: all integration tests in one target.

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

mod bridge_replay;
mod destructive_confirm;
mod event_wiring;
