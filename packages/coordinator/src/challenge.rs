//! Withdrawal challenge period
//!
//! The timer is pure: it only answers questions about a transfer at a given
//! instant. Scheduling the continuation is the engine's job. Time is read
//! through [`Clock`] so the seven-day window can be exercised in tests.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::Duration;

use crate::types::Transfer;

/// Saturation value for durations chrono cannot represent
fn far_future() -> ChronoDuration {
    ChronoDuration::days(36_500)
}

/// Source of wall-clock time
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let by = ChronoDuration::from_std(by).unwrap_or_else(|_| far_future());
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChallengeTimer {
    period: Duration,
}

impl ChallengeTimer {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Deadline for a withdrawal validated at `now`
    pub fn deadline_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = ChronoDuration::from_std(self.period).unwrap_or_else(|_| far_future());
        now.checked_add_signed(period).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Time left before the transfer may be released; zero once elapsed
    pub fn remaining(&self, transfer: &Transfer, now: DateTime<Utc>) -> Duration {
        if !transfer.direction.is_withdrawal() {
            return Duration::ZERO;
        }
        match transfer.challenge_deadline {
            Some(deadline) => (deadline - now).to_std().unwrap_or(Duration::ZERO),
            None => self.period,
        }
    }

    /// Whether the transfer has cleared its challenge window.
    ///
    /// Deposits have no window. A withdrawal without a recorded deadline has
    /// not started its window and so has not elapsed.
    pub fn elapsed(&self, transfer: &Transfer, now: DateTime<Utc>) -> bool {
        if !transfer.direction.is_withdrawal() {
            return true;
        }
        match transfer.challenge_deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}
