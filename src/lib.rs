//! # OmniShot Dispatch
//!
//! The admission-control and job-scheduling core of the OmniShot platform.
//!
//! OmniShot turns user photos into AI-generated professional headshots. The
//! transformation jobs are slow and expensive, and the endpoints that create
//! them are abuse-prone. This crate owns the two layers that keep the rest of
//! the service honest:
//!
//! - **Admission control**: allow/deny decisions per `(identity, endpoint
//!   class)` using pluggable throttling algorithms (fixed window, sliding
//!   window log, token bucket) with subscription-tier ceilings and an
//!   adaptive mode that sheds load under pressure.
//! - **Job scheduling**: a priority-ordered queue and a bounded-concurrency
//!   execution loop that dispatches to registered per-type executors, retries
//!   transient failures with progressive backoff, supports cooperative
//!   cancellation, and recovers non-terminal jobs after a crash.
//!
//! ## Admission
//!
//! ```rust,ignore
//! use omnishot_dispatch::admission::{AdmissionController, Identity, RateLimit, RateLimitAlgorithm};
//! use omnishot_dispatch::infra::counter::InMemoryCounterStore;
//!
//! let controller = AdmissionController::new(config, Arc::new(InMemoryCounterStore::new()), clock);
//!
//! let decision = controller
//!     .check_and_consume(
//!         &Identity::user("u-314"),
//!         "generation",
//!         RateLimitAlgorithm::TokenBucket,
//!         &RateLimit::bucket(10, 1, 1_000),
//!     )
//!     .await;
//!
//! if !decision.allowed {
//!     return reply_429(decision.denial_body());
//! }
//! ```
//!
//! ## Scheduling
//!
//! ```rust,ignore
//! use omnishot_dispatch::core::{ExecutorRegistry, JobKind, JobPayload, JobScheduler, Priority};
//! use omnishot_dispatch::infra::store::InMemoryJobStore;
//!
//! let mut registry = ExecutorRegistry::new();
//! registry.register(JobKind::GenerateHeadshot, Arc::new(HeadshotExecutor::new(provider)));
//!
//! let scheduler = JobScheduler::new(config, Arc::new(InMemoryJobStore::new()), registry, clock);
//! scheduler.recover().await?;          // demote interrupted jobs back to queued
//! let loop_handle = scheduler.start(); // wake-driven processing loop
//!
//! let id = scheduler
//!     .add_job(
//!         JobPayload::GenerateHeadshot {
//!             user_id: "u-314".into(),
//!             source_key: "uploads/u-314/raw.png".into(),
//!             style: "corporate".into(),
//!         },
//!         Some(Priority::High),
//!         None,
//!     )
//!     .await?;
//! ```
//!
//! The Counter Store and Job Store are ports: production deployments back
//! them with an external store whose per-key operations are atomic, while
//! `infra` ships in-memory adapters for development and tests.
//!
//! For complete examples, see:
//! - `tests/scheduler_test.rs` - Full scheduling integration tests
//! - `tests/admission_test.rs` - Throttling algorithm tests

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Throttling decisions, algorithms, and tier limits.
pub mod admission;
/// Configuration models for the scheduler and admission layers.
pub mod config;
/// Job model, priority lanes, executor ports, and the scheduler.
pub mod core;
/// In-memory adapters for the counter and job store ports.
pub mod infra;
/// Shared utilities.
pub mod util;
