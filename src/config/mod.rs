//! Configuration models for the scheduler and admission layers.

pub mod dispatch;

pub use dispatch::{
    AdaptiveConfig, AdmissionConfig, AlertConfig, ClassLimits, DispatchConfig, SchedulerConfig,
};
