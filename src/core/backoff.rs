//! Shared retry backoff policy for reconnect loops.

use std::time::Duration;

/// Exponential backoff schedule shared by the event-socket reconnect loop
/// and the recognition client's reconnect loop.
///
/// `delay(attempt)` returns the sleep before attempt number `attempt`
/// (1-based). Returns `None` once `max_attempts` is exhausted; policies
/// with `max_attempts: None` never give up.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// Unbounded policy used for the switch connection: 1s, 2s, 4s, ... capped at 30s.
    pub fn reconnect() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            max_attempts: None,
        }
    }

    /// Bounded policy for backend stream reconnects.
    pub fn backend() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(8),
            max_attempts: Some(3),
        }
    }

    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base.as_secs_f64() * exp;
        Some(Duration::from_secs_f64(raw.min(self.cap.as_secs_f64())))
    }
}
