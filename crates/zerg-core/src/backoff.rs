//! Backoff delays for task retries.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How retry delays grow with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
        };
        f.write_str(s)
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fixed" => Ok(Self::Fixed),
            other => Err(format!("unknown backoff strategy: {other:?}")),
        }
    }
}

/// Compute the delay before retry `attempt` (1-based), in seconds.
///
/// The raw delay is `base * 2^attempt`, `base * attempt`, or `base`
/// depending on strategy, capped at `max_seconds`, then ±10% uniform jitter
/// is applied and the result floored at zero.
pub fn calculate_delay(
    attempt: u32,
    strategy: BackoffStrategy,
    base_seconds: u32,
    max_seconds: u32,
) -> f64 {
    let base = f64::from(base_seconds);
    let raw = match strategy {
        BackoffStrategy::Exponential => base * f64::from(2u32.saturating_pow(attempt.min(30))),
        BackoffStrategy::Linear => base * f64::from(attempt),
        BackoffStrategy::Fixed => base,
    };
    let capped = raw.min(f64::from(max_seconds));

    let jitter = capped * 0.1;
    let delay = if jitter > 0.0 {
        capped + rand::rng().random_range(-jitter..=jitter)
    } else {
        capped
    };
    delay.max(0.0)
}
