//! Turn-limit policy for conversation sessions.

use crate::config::ConversationConfig;
use serde::Serialize;

const BASE_TURNS_MAX: u32 = 32;
const EXTEND_BY_MAX: u32 = 16;
const HARD_CAP_MAX: u32 = 64;

/// How many turns a conversation loop may run before the listener stops it.
///
/// Bounds are clamped on construction: `base_turns` to 1..=32, `extend_by`
/// to 1..=16, `hard_cap` to `base_turns..=64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TurnLimitPolicy {
    base_turns: u32,
    extend_by: u32,
    hard_cap: u32,
}

/// A resolved limit and how many extensions it took to get there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TurnLimit {
    pub limit: u32,
    pub extensions_used: u32,
}

impl TurnLimitPolicy {
    #[must_use]
    pub fn new(base_turns: u32, extend_by: u32, hard_cap: u32) -> Self {
        let base_turns = base_turns.clamp(1, BASE_TURNS_MAX);
        Self {
            base_turns,
            extend_by: extend_by.clamp(1, EXTEND_BY_MAX),
            hard_cap: hard_cap.clamp(base_turns, HARD_CAP_MAX),
        }
    }

    #[must_use]
    pub fn from_config(config: &ConversationConfig) -> Self {
        Self::new(config.base_turns, config.extend_by, config.hard_cap)
    }

    #[must_use]
    pub fn base_turns(&self) -> u32 {
        self.base_turns
    }

    #[must_use]
    pub fn extend_by(&self) -> u32 {
        self.extend_by
    }

    #[must_use]
    pub fn hard_cap(&self) -> u32 {
        self.hard_cap
    }

    /// Limit for a fresh loop.
    #[must_use]
    pub fn initial(&self) -> TurnLimit {
        self.limit_for(self.base_turns)
    }

    /// Clamp a listener-declared `max_turns` into `[base_turns, hard_cap]`.
    #[must_use]
    pub fn declared(&self, max_turns: i64) -> TurnLimit {
        let clamped = max_turns.clamp(i64::from(self.base_turns), i64::from(self.hard_cap));
        self.limit_for(u32::try_from(clamped).unwrap_or(self.base_turns))
    }

    /// One extension past `current`, saturating at `hard_cap`.
    #[must_use]
    pub fn extended(&self, current: u32) -> TurnLimit {
        let next = current.max(self.base_turns).saturating_add(self.extend_by);
        self.limit_for(next.min(self.hard_cap))
    }

    fn limit_for(&self, limit: u32) -> TurnLimit {
        let extensions_used = if limit > self.base_turns {
            (limit - self.base_turns).div_ceil(self.extend_by)
        } else {
            0
        };
        TurnLimit {
            limit,
            extensions_used,
        }
    }
}

impl Default for TurnLimitPolicy {
    fn default() -> Self {
        Self::from_config(&ConversationConfig::default())
    }
}
