//! Subscription tiers, throttling algorithms, and limit configurations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Subscription tier, ordered from cheapest to most generous. Each tier maps
/// to a per-endpoint-class request ceiling in the admission config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Unpaid accounts.
    Free,
    /// Individual paid plan.
    Professional,
    /// Team plan.
    Business,
    /// Contract customers.
    Enterprise,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Professional => "professional",
            Self::Business => "business",
            Self::Enterprise => "enterprise",
        };
        write!(f, "{name}")
    }
}

/// Counting mechanism used for an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Discrete non-overlapping buckets with an expiring counter.
    FixedWindow,
    /// Timestamp log counted over a continuously trailing interval.
    SlidingWindow,
    /// Token bucket with lazy refill.
    TokenBucket,
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FixedWindow => "fixed_window",
            Self::SlidingWindow => "sliding_window",
            Self::TokenBucket => "token_bucket",
        };
        write!(f, "{name}")
    }
}

/// Limit parameters for one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimit {
    /// `max` admissions per `window_ms`, for the window-based algorithms.
    Windowed {
        /// Admissions allowed per window.
        max: u32,
        /// Window length in milliseconds.
        window_ms: u64,
    },
    /// Token bucket parameters.
    Bucket {
        /// Maximum stored tokens.
        capacity: u32,
        /// Tokens added per refill interval.
        refill_rate: u32,
        /// Refill interval in milliseconds.
        refill_interval_ms: u64,
    },
}

impl RateLimit {
    /// Window-based limit: `max` admissions per `window_ms`.
    pub fn windowed(max: u32, window_ms: u64) -> Self {
        Self::Windowed { max, window_ms }
    }

    /// Token-bucket limit.
    pub fn bucket(capacity: u32, refill_rate: u32, refill_interval_ms: u64) -> Self {
        Self::Bucket {
            capacity,
            refill_rate,
            refill_interval_ms,
        }
    }

    /// The nominal ceiling: window max or bucket capacity.
    pub fn max(&self) -> u32 {
        match self {
            Self::Windowed { max, .. } => *max,
            Self::Bucket { capacity, .. } => *capacity,
        }
    }

    /// Scale the ceiling by `factor`, never below one admission. Used by
    /// adaptive limiting.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |base: u32| ((f64::from(base) * factor).floor() as u32).max(1);
        match self {
            Self::Windowed { max, window_ms } => Self::Windowed {
                max: scale(*max),
                window_ms: *window_ms,
            },
            Self::Bucket {
                capacity,
                refill_rate,
                refill_interval_ms,
            } => Self::Bucket {
                capacity: scale(*capacity),
                refill_rate: *refill_rate,
                refill_interval_ms: *refill_interval_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Free < Tier::Professional);
        assert!(Tier::Professional < Tier::Business);
        assert!(Tier::Business < Tier::Enterprise);
    }

    #[test]
    fn test_scaled_floors_at_one() {
        let limit = RateLimit::windowed(2, 60_000);
        assert_eq!(limit.scaled(0.1).max(), 1);
        assert_eq!(limit.scaled(0.5).max(), 1);
        assert_eq!(limit.scaled(1.0).max(), 2);
    }

    #[test]
    fn test_scaled_preserves_window() {
        let RateLimit::Windowed { max, window_ms } = RateLimit::windowed(100, 60_000).scaled(0.75)
        else {
            panic!("variant changed");
        };
        assert_eq!(max, 75);
        assert_eq!(window_ms, 60_000);
    }
}
