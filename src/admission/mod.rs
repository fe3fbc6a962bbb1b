//! Admission control: throttling decisions per identity and endpoint class.

pub mod controller;
pub mod identity;
pub mod limits;
pub mod metrics;
pub mod store;

pub use controller::{
    AdmissionController, Decision, DenialAlert, DenialAlertFn, LimitStatus, LoadMonitor,
};
pub use identity::Identity;
pub use limits::{RateLimit, RateLimitAlgorithm, Tier};
pub use metrics::{AdmissionMetrics, AdmissionSnapshot};
pub use store::{BucketOutcome, BucketParams, CounterStore, LogOutcome, WindowCount};
