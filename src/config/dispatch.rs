//! Scheduler and admission configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::limits::{RateLimitAlgorithm, Tier};
use crate::core::job::JobKind;

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Jobs allowed in `processing` at once.
    pub max_concurrent: usize,
    /// Ceiling on `queued + processing` before submissions are rejected.
    pub max_queue_size: usize,
    /// Default attempt budget for submissions that do not specify one.
    pub default_max_attempts: u32,
    /// Backoff delays indexed by attempt count; attempts beyond the table
    /// clamp to the last entry.
    pub backoff_ms: Vec<u64>,
    /// Execution timeout for job types without a specific entry.
    pub default_timeout_secs: u64,
    /// Per-type execution timeouts.
    pub timeout_secs_by_type: HashMap<JobKind, u64>,
    /// Safety-net wake interval for the processing loop.
    pub tick_interval_ms: u64,
    /// How long terminal jobs are retained before the cleanup sweep.
    pub retention_secs: u64,
    /// How often the cleanup sweep runs.
    pub cleanup_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: num_cpus::get(),
            max_queue_size: 100,
            default_max_attempts: 3,
            backoff_ms: vec![1_000, 5_000, 30_000],
            default_timeout_secs: 300,
            timeout_secs_by_type: HashMap::new(),
            tick_interval_ms: 500,
            retention_secs: 3_600,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be greater than 0".into());
        }
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".into());
        }
        if self.default_max_attempts == 0 {
            return Err("default_max_attempts must be greater than 0".into());
        }
        if self.backoff_ms.is_empty() {
            return Err("backoff_ms must have at least one entry".into());
        }
        if self.default_timeout_secs == 0 {
            return Err("default_timeout_secs must be greater than 0".into());
        }
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Backoff delay before re-queueing after the given failed attempt
    /// count, clamped to the table's last entry.
    pub fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        let index = (attempts.max(1) as usize - 1).min(self.backoff_ms.len() - 1);
        self.backoff_ms[index]
    }

    /// Execution timeout for a job type.
    pub fn timeout_for(&self, kind: JobKind) -> Duration {
        let secs = self
            .timeout_secs_by_type
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout_secs);
        Duration::from_secs(secs)
    }
}

/// Per-endpoint-class tier ceilings and window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassLimits {
    /// Ceiling for free accounts.
    pub free: u32,
    /// Ceiling for professional accounts.
    pub professional: u32,
    /// Ceiling for business accounts.
    pub business: u32,
    /// Ceiling for enterprise accounts.
    pub enterprise: u32,
    /// Counting window for this class in milliseconds.
    pub window_ms: u64,
}

impl ClassLimits {
    /// The ceiling for a tier.
    pub fn ceiling(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Free => self.free,
            Tier::Professional => self.professional,
            Tier::Business => self.business,
            Tier::Enterprise => self.enterprise,
        }
    }
}

/// Adaptive limiting parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Lower bound on the load scale factor; keeps the effective limit from
    /// collapsing to zero under full load.
    pub floor_fraction: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            floor_fraction: 0.2,
        }
    }
}

/// Denial-surge alerting parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Denial fraction that triggers the alert callback.
    pub denial_rate_threshold: f64,
    /// Sampling window for the denial rate.
    pub window_ms: u64,
    /// Checks required in the window before the rate is meaningful.
    pub min_samples: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            denial_rate_threshold: 0.5,
            window_ms: 60_000,
            min_samples: 20,
        }
    }
}

/// Admission controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Counting mechanism for tier-based checks.
    pub default_algorithm: RateLimitAlgorithm,
    /// Tier ceilings keyed by endpoint class.
    pub classes: HashMap<String, ClassLimits>,
    /// Adaptive limiting; absent means tier ceilings apply unscaled.
    pub adaptive: Option<AdaptiveConfig>,
    /// Denial-surge alerting; absent disables the callback.
    pub alert: Option<AlertConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let mut classes = HashMap::new();
        classes.insert(
            "generation".to_string(),
            ClassLimits {
                free: 5,
                professional: 25,
                business: 100,
                enterprise: 500,
                window_ms: 3_600_000,
            },
        );
        classes.insert(
            "upload".to_string(),
            ClassLimits {
                free: 20,
                professional: 50,
                business: 200,
                enterprise: 1_000,
                window_ms: 3_600_000,
            },
        );
        classes.insert(
            "account".to_string(),
            ClassLimits {
                free: 30,
                professional: 60,
                business: 120,
                enterprise: 240,
                window_ms: 60_000,
            },
        );
        Self {
            default_algorithm: RateLimitAlgorithm::FixedWindow,
            classes,
            adaptive: None,
            alert: None,
        }
    }
}

impl AdmissionConfig {
    /// Validate admission configuration values.
    pub fn validate(&self) -> Result<(), String> {
        for (class, limits) in &self.classes {
            if limits.window_ms == 0 {
                return Err(format!("class `{class}`: window_ms must be greater than 0"));
            }
            if limits.enterprise == 0 {
                return Err(format!(
                    "class `{class}`: enterprise ceiling must be greater than 0"
                ));
            }
        }
        if let Some(adaptive) = &self.adaptive {
            if !(adaptive.floor_fraction > 0.0 && adaptive.floor_fraction <= 1.0) {
                return Err("adaptive.floor_fraction must be in (0, 1]".into());
            }
        }
        if let Some(alert) = &self.alert {
            if !(alert.denial_rate_threshold > 0.0 && alert.denial_rate_threshold <= 1.0) {
                return Err("alert.denial_rate_threshold must be in (0, 1]".into());
            }
            if alert.window_ms == 0 {
                return Err("alert.window_ms must be greater than 0".into());
            }
        }
        Ok(())
    }
}

/// Root configuration for the dispatch core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Scheduler tuning.
    pub scheduler: SchedulerConfig,
    /// Admission tuning.
    pub admission: AdmissionConfig,
}

impl DispatchConfig {
    /// Validate both halves.
    pub fn validate(&self) -> Result<(), String> {
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler config invalid: {e}"))?;
        self.admission
            .validate()
            .map_err(|e| format!("admission config invalid: {e}"))
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load defaults, apply `.env`, then apply `OMNISHOT_*` environment
    /// overrides for the operationally interesting scalars.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();
        let mut cfg = Self::default();
        if let Some(v) = env_parse("OMNISHOT_MAX_CONCURRENT")? {
            cfg.scheduler.max_concurrent = v;
        }
        if let Some(v) = env_parse("OMNISHOT_MAX_QUEUE_SIZE")? {
            cfg.scheduler.max_queue_size = v;
        }
        if let Some(v) = env_parse("OMNISHOT_RETENTION_SECS")? {
            cfg.scheduler.retention_secs = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, String> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| format!("{name} has invalid value `{raw}`")),
        Err(_) => Ok(None),
    }
}
