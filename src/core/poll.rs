use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded, fixed-interval polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval_ms: u64) -> Self {
        Self {
            attempts,
            interval_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Wall-clock time spent before giving up.
    pub fn budget(&self) -> Duration {
        self.interval() * self.attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollExhausted {
    pub attempts: u32,
}

/// Sleeps one interval, then runs `check`, up to `policy.attempts` times.
///
/// `check` receives the 1-based attempt number. The loop ends on the first
/// `Some`; there is no other way to stop it early.
pub async fn poll_until<T, F>(policy: PollPolicy, mut check: F) -> Result<T, PollExhausted>
where
    F: FnMut(u32) -> Option<T>,
{
    for attempt in 1..=policy.attempts {
        tokio::time::sleep(policy.interval()).await;
        if let Some(v) = check(attempt) {
            return Ok(v);
        }
    }
    Err(PollExhausted {
        attempts: policy.attempts,
    })
}
