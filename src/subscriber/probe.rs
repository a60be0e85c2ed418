use std::time::Duration;

use crate::error::{Error, SessionError};

/// Spacing of readiness probes while the engine is unavailable.
///
/// The default is a fixed one second interval. `multiplier` and
/// `max_interval` allow growing the interval between consecutive failed
/// probes; the count restarts once the engine answers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbePolicy {
    /// Delay after the first failed probe.
    pub interval: Duration,
    /// Growth applied per further failed probe (1.0 keeps it fixed).
    pub multiplier: f64,
    /// Upper bound on the delay.
    pub max_interval: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl ProbePolicy {
    /// Probe every `interval`.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            multiplier: 1.0,
            max_interval: interval,
        }
    }

    /// Grow the delay by `multiplier` after each failed probe, up to `max_interval`.
    pub fn backoff(interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            interval,
            multiplier,
            max_interval,
        }
    }

    /// Delay following failed probe number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.interval.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped)
        } else {
            self.max_interval
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.interval.is_zero() {
            return Err(invalid("probe interval must be > 0"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(invalid("probe multiplier must be >= 1.0"));
        }
        if self.max_interval < self.interval {
            return Err(invalid("probe max_interval must be >= interval"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> Error {
    SessionError::InvalidConfig(msg.into()).into()
}
