//! Admission controller: allow/deny decisions with tier and adaptive limits.
//!
//! Every check costs at most one Counter Store round trip. Store failures
//! fail open: availability beats strict enforcement, so a broken store
//! admits the request, logs, and counts the failure in metrics.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::admission::identity::Identity;
use crate::admission::limits::{RateLimit, RateLimitAlgorithm, Tier};
use crate::admission::metrics::AdmissionMetrics;
use crate::admission::store::{BucketParams, CounterStore};
use crate::config::AdmissionConfig;
use crate::core::error::{DispatchError, StoreError};
use crate::util::clock::Clock;

/// Outcome of one admission check, with the metadata callers surface as
/// rate-limit response headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// The effective ceiling applied to this check.
    pub limit: u32,
    /// Admissions left before denial.
    pub remaining: u32,
    /// When the counter resets or the next slot frees.
    pub reset_at_ms: u64,
    /// Seconds the caller should wait before retrying; 0 when allowed.
    pub retry_after_secs: u64,
    /// System load factored into an adaptive check.
    pub load: Option<f64>,
    /// True when the store failed and this decision fell open.
    pub degraded: bool,
}

impl Decision {
    /// Machine-readable denial body for "too many requests" responses.
    pub fn denial_body(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": "Rate limit exceeded. Try again later.",
            "code": "RATE_LIMIT_EXCEEDED",
            "retryAfterSeconds": self.retry_after_secs,
        })
    }
}

/// Non-consuming limit state for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitStatus {
    /// The tier's ceiling for the class.
    pub limit: u32,
    /// Admissions left in the current window or bucket.
    pub remaining: u32,
    /// When the counter resets or the next slot frees.
    pub reset_at_ms: u64,
    /// The tier the status was computed for.
    pub tier: Tier,
}

/// Port for the external resource-metrics collaborator feeding adaptive
/// limits. Implementations report utilization in `[0, 1]`.
pub trait LoadMonitor: Send + Sync {
    /// Current system load; values outside `[0, 1]` are clamped.
    fn system_load(&self) -> f64;
}

/// Details handed to the denial-surge alert callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenialAlert {
    /// Observed denial fraction in the sampling window.
    pub denial_rate: f64,
    /// Denials observed in the window.
    pub denials: u64,
    /// Total checks observed in the window.
    pub checks: u64,
    /// Length of the sampling window.
    pub window_ms: u64,
}

/// Callback invoked when the denial rate crosses the alert threshold.
pub type DenialAlertFn = Arc<dyn Fn(&DenialAlert) + Send + Sync>;

#[derive(Debug, Default)]
struct DenialWindow {
    started_ms: u64,
    checks: u64,
    denials: u64,
    fired: bool,
}

/// Allow/deny decisions for `(identity, endpoint class)` pairs.
pub struct AdmissionController {
    config: AdmissionConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    load_monitor: Option<Arc<dyn LoadMonitor>>,
    on_denial_surge: Option<DenialAlertFn>,
    metrics: AdmissionMetrics,
    denial_window: Mutex<DenialWindow>,
}

impl AdmissionController {
    /// Create a controller over a counter store.
    pub fn new(config: AdmissionConfig, store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            load_monitor: None,
            on_denial_surge: None,
            metrics: AdmissionMetrics::new(),
            denial_window: Mutex::new(DenialWindow::default()),
        }
    }

    /// Attach the resource-metrics collaborator that drives adaptive limits.
    #[must_use]
    pub fn with_load_monitor(mut self, monitor: Arc<dyn LoadMonitor>) -> Self {
        self.load_monitor = Some(monitor);
        self
    }

    /// Attach a callback invoked when the denial rate crosses the configured
    /// threshold, at most once per sampling window.
    #[must_use]
    pub fn with_denial_alert(mut self, callback: DenialAlertFn) -> Self {
        self.on_denial_surge = Some(callback);
        self
    }

    /// Admission counters.
    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    /// Decide whether to admit one request for `identity` against
    /// `endpoint_class`, consuming quota when admitted.
    pub async fn check_and_consume(
        &self,
        identity: &Identity,
        endpoint_class: &str,
        algorithm: RateLimitAlgorithm,
        limit: &RateLimit,
    ) -> Decision {
        let now_ms = self.clock.now_ms();
        let outcome = self
            .run_algorithm(identity, endpoint_class, algorithm, limit, now_ms)
            .await;

        let decision = match outcome {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    %identity,
                    endpoint_class,
                    %algorithm,
                    error = %err,
                    "counter store failed; admitting request (fail open)"
                );
                self.metrics.record_store_failure();
                Self::fail_open(limit, now_ms)
            }
        };

        if decision.allowed {
            self.metrics.record_allowed();
        } else {
            self.metrics.record_denied();
            tracing::debug!(
                %identity,
                endpoint_class,
                retry_after_secs = decision.retry_after_secs,
                "request denied by rate limit"
            );
        }
        self.note_for_alert(decision.allowed, now_ms);
        decision
    }

    /// Tier-based check: the ceiling comes from the config table for
    /// `endpoint_class`, scaled down under load when adaptive limiting is
    /// configured, and counted with the default algorithm.
    pub async fn check_tiered(
        &self,
        identity: &Identity,
        tier: Tier,
        endpoint_class: &str,
    ) -> Result<Decision, DispatchError> {
        let class = self.config.classes.get(endpoint_class).ok_or_else(|| {
            DispatchError::Validation(format!("unknown endpoint class `{endpoint_class}`"))
        })?;

        let base = RateLimit::windowed(class.ceiling(tier), class.window_ms);
        let (limit, load) = self.apply_adaptive(&base);
        let limit = match self.config.default_algorithm {
            RateLimitAlgorithm::TokenBucket => {
                // Window ceilings translate to a bucket that replenishes a
                // full allowance each window.
                RateLimit::bucket(limit.max(), limit.max().max(1), class.window_ms)
            }
            RateLimitAlgorithm::FixedWindow | RateLimitAlgorithm::SlidingWindow => limit,
        };

        let mut decision = self
            .check_and_consume(identity, endpoint_class, self.config.default_algorithm, &limit)
            .await;
        decision.load = load;
        Ok(decision)
    }

    /// Non-consuming limit state for the admin surface. Store errors
    /// propagate here; an admin read has no availability mandate.
    pub async fn status(
        &self,
        identity: &Identity,
        tier: Tier,
        endpoint_class: &str,
    ) -> Result<LimitStatus, DispatchError> {
        let class = self.config.classes.get(endpoint_class).ok_or_else(|| {
            DispatchError::Validation(format!("unknown endpoint class `{endpoint_class}`"))
        })?;
        let limit = class.ceiling(tier);
        let now_ms = self.clock.now_ms();

        let (remaining, reset_at_ms) = match self.config.default_algorithm {
            RateLimitAlgorithm::FixedWindow => {
                let key = identity.counter_key(endpoint_class);
                match self.store.window_peek(&key, now_ms).await? {
                    Some(wc) => (limit.saturating_sub(wc.count), wc.expires_at_ms),
                    None => (limit, now_ms),
                }
            }
            RateLimitAlgorithm::SlidingWindow => {
                let key = identity.sliding_key(endpoint_class);
                let log = self.store.log_count(&key, class.window_ms, now_ms).await?;
                let reset = log
                    .oldest_ms
                    .map_or(now_ms, |oldest| oldest + class.window_ms);
                (limit.saturating_sub(log.count), reset)
            }
            RateLimitAlgorithm::TokenBucket => {
                let key = identity.counter_key(endpoint_class);
                let params = BucketParams {
                    capacity: limit,
                    refill_rate: limit.max(1),
                    refill_interval_ms: class.window_ms,
                };
                let bucket = self.store.bucket_peek(&key, &params, now_ms).await?;
                (bucket.tokens, bucket.next_refill_ms)
            }
        };

        Ok(LimitStatus {
            limit,
            remaining,
            reset_at_ms,
            tier,
        })
    }

    /// Clear counters for an identity: one endpoint class, or every class in
    /// the tier table when `endpoint_class` is `None`.
    pub async fn reset(
        &self,
        identity: &Identity,
        endpoint_class: Option<&str>,
    ) -> Result<(), DispatchError> {
        let classes: Vec<&str> = match endpoint_class {
            Some(class) => vec![class],
            None => self.config.classes.keys().map(String::as_str).collect(),
        };
        for class in classes {
            self.store.remove(&identity.counter_key(class)).await?;
            self.store.remove(&identity.sliding_key(class)).await?;
        }
        tracing::info!(%identity, ?endpoint_class, "rate limit state reset");
        Ok(())
    }

    async fn run_algorithm(
        &self,
        identity: &Identity,
        endpoint_class: &str,
        algorithm: RateLimitAlgorithm,
        limit: &RateLimit,
        now_ms: u64,
    ) -> Result<Decision, StoreError> {
        match (algorithm, limit) {
            (RateLimitAlgorithm::FixedWindow, RateLimit::Windowed { max, window_ms }) => {
                let key = identity.counter_key(endpoint_class);
                let wc = self.store.window_incr(&key, *window_ms, now_ms).await?;
                let allowed = wc.count <= *max;
                Ok(Decision {
                    allowed,
                    limit: *max,
                    remaining: max.saturating_sub(wc.count),
                    reset_at_ms: wc.expires_at_ms,
                    retry_after_secs: if allowed {
                        0
                    } else {
                        secs_until(wc.expires_at_ms, now_ms)
                    },
                    load: None,
                    degraded: false,
                })
            }
            (RateLimitAlgorithm::SlidingWindow, RateLimit::Windowed { max, window_ms }) => {
                let key = identity.sliding_key(endpoint_class);
                let log = self
                    .store
                    .log_trim_insert(&key, *window_ms, *max, now_ms)
                    .await?;
                let reset_at_ms = log.oldest_ms.map_or(now_ms, |oldest| oldest + window_ms);
                Ok(Decision {
                    allowed: log.admitted,
                    limit: *max,
                    remaining: max.saturating_sub(log.count),
                    reset_at_ms,
                    retry_after_secs: if log.admitted {
                        0
                    } else {
                        secs_until(reset_at_ms, now_ms)
                    },
                    load: None,
                    degraded: false,
                })
            }
            (
                RateLimitAlgorithm::TokenBucket,
                RateLimit::Bucket {
                    capacity,
                    refill_rate,
                    refill_interval_ms,
                },
            ) => {
                let key = identity.counter_key(endpoint_class);
                let params = BucketParams {
                    capacity: *capacity,
                    refill_rate: *refill_rate,
                    refill_interval_ms: *refill_interval_ms,
                };
                let bucket = self.store.bucket_take(&key, &params, now_ms).await?;
                Ok(Decision {
                    allowed: bucket.taken,
                    limit: *capacity,
                    remaining: bucket.tokens,
                    reset_at_ms: bucket.next_refill_ms,
                    retry_after_secs: if bucket.taken {
                        0
                    } else {
                        secs_until(bucket.next_refill_ms, now_ms)
                    },
                    load: None,
                    degraded: false,
                })
            }
            // A bucket config paired with a window algorithm (or the
            // reverse) is a wiring bug in the caller; fall open rather than
            // block traffic on it.
            (algorithm, _) => Err(StoreError::Corrupt(format!(
                "limit config does not match algorithm {algorithm}"
            ))),
        }
    }

    fn apply_adaptive(&self, base: &RateLimit) -> (RateLimit, Option<f64>) {
        let (Some(adaptive), Some(monitor)) = (&self.config.adaptive, &self.load_monitor) else {
            return (base.clone(), None);
        };
        let load = monitor.system_load().clamp(0.0, 1.0);
        let factor = (1.0 - load).max(adaptive.floor_fraction);
        (base.scaled(factor), Some(load))
    }

    fn fail_open(limit: &RateLimit, now_ms: u64) -> Decision {
        Decision {
            allowed: true,
            limit: limit.max(),
            remaining: limit.max(),
            reset_at_ms: now_ms,
            retry_after_secs: 0,
            load: None,
            degraded: true,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn note_for_alert(&self, allowed: bool, now_ms: u64) {
        let (Some(cfg), Some(callback)) = (&self.config.alert, &self.on_denial_surge) else {
            return;
        };

        let alert = {
            let mut window = self.denial_window.lock();
            if now_ms.saturating_sub(window.started_ms) >= cfg.window_ms {
                *window = DenialWindow {
                    started_ms: now_ms,
                    ..DenialWindow::default()
                };
            }
            window.checks += 1;
            if !allowed {
                window.denials += 1;
            }
            let rate = window.denials as f64 / window.checks as f64;
            if !window.fired
                && window.checks >= u64::from(cfg.min_samples)
                && rate >= cfg.denial_rate_threshold
            {
                window.fired = true;
                Some(DenialAlert {
                    denial_rate: rate,
                    denials: window.denials,
                    checks: window.checks,
                    window_ms: cfg.window_ms,
                })
            } else {
                None
            }
        };

        if let Some(alert) = alert {
            tracing::warn!(
                denial_rate = alert.denial_rate,
                checks = alert.checks,
                "denial rate crossed alert threshold"
            );
            callback(&alert);
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .field("adaptive", &self.load_monitor.is_some())
            .finish_non_exhaustive()
    }
}

/// Whole seconds until `target_ms`, rounded up, at least 1 for a denial in
/// the future.
fn secs_until(target_ms: u64, now_ms: u64) -> u64 {
    target_ms.saturating_sub(now_ms).div_ceil(1_000).max(1)
}
