//! Retry policy shared by mediator health checks and verification

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_MAX_ATTEMPTS;

/// Bounded retry with a fixed pause between attempts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of recovery attempts (mediator restarts)
    pub max_attempts: u32,
    /// Pause between attempts
    #[serde(with = "duration_millis")]
    pub between_attempts: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            between_attempts: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, between_attempts: Duration) -> Self {
        Self {
            max_attempts,
            between_attempts,
        }
    }

    /// Policy without pauses, for tests and dry runs
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// Fresh budget for one guarded operation
    pub fn budget(&self) -> RestartBudget {
        RestartBudget {
            max: self.max_attempts,
            used: 0,
        }
    }
}

/// Restart attempts left for one guarded operation
///
/// Passed by `&mut` through nested checks so an outer operation and the
/// health checks it triggers share a single bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartBudget {
    max: u32,
    used: u32,
}

impl RestartBudget {
    /// Take one attempt; false once the budget is exhausted
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.max {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.max - self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
