//! Vigil - distributed scan-job lifecycle management.
//!
//! Long-running scan jobs are spread across a fleet of workers through a
//! shared queue store. Vigil owns everything around the scan itself: handing
//! a job from the queue to exactly one worker, detecting dead workers through
//! expiring heartbeats, recovering their orphaned jobs, bounding retries with
//! a dead-letter sink, and draining in-flight work on shutdown.
//!
//! # Core Concepts
//!
//! - **Queue Store**: The [`QueueStore`] trait abstracts the Redis-style
//!   hash/list/expiring-key store every other component is built on.
//!
//! - **Ledger**: [`JobLedger`] keeps job definitions, status projections and
//!   the in-flight ownership index.
//!
//! - **Dispatch**: [`DispatchQueue`] is the FIFO workers pop from.
//!
//! - **Liveness**: [`LivenessTracker`] maintains per-worker heartbeat keys;
//!   expiry is the only death signal.
//!
//! - **Recovery**: [`RecoverySweeper`] finds jobs owned by dead workers and
//!   routes them through the [`FailureHandler`], the single retry/dead-letter
//!   path shared with ordinary execution failures.
//!
//! - **Runtime**: [`WorkerPool`] runs a bounded number of jobs against a
//!   [`ScanEngine`], with heartbeat, sweeper and graceful shutdown.
//!
//! - **Client**: [`JobClient`] submits jobs and exposes status, results and
//!   the dead-letter sink.
//!
//! # Feature Flags
//!
//! - `redis` - Redis queue store via the `redis` crate
//! - `metrics` - Prometheus metrics support
//!
//! # Delivery
//!
//! Execution is at-least-once. Multi-step store updates are ordered so that
//! a crash can duplicate a job but never lose it.

/// Scan engine and result reporting collaborators.
pub mod engine;

/// Configuration: key layout, heartbeat timing and environment loading.
pub mod config;

/// Client-side submission and inspection.
pub mod client;

/// Job lifecycle events and the in-process event bus.
pub mod events;

/// Job definitions, options, states and status projections.
pub mod job;

/// Ledger of definitions, statuses and in-flight ownership.
pub mod ledger;

/// Heartbeat-based worker liveness.
pub mod liveness;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

#[cfg(feature = "redis")]
/// Redis persistence for the queue store.
pub mod persistence;

/// Retry decisions, the shared failure path and the dead-letter sink.
pub mod policy;

/// The shared dispatch queue.
pub mod queue;

/// Worker pool, job execution and shutdown.
pub mod runtime;

/// The queue store abstraction.
pub mod store;

/// Orphan recovery.
pub mod sweeper;

/// Tracing spans and recording helpers.
pub mod telemetry;

pub use client::JobClient;
pub use config::*;
pub use engine::*;
pub use events::*;
pub use job::*;
pub use ledger::{JobLedger, StatusUpdate};
pub use liveness::LivenessTracker;
pub use policy::*;
pub use queue::*;
pub use runtime::{
    ActiveJob, JobError, JobExecutor, JobOutcome, ShutdownToken, WorkerConfig, WorkerPool,
    WorkerPoolBuilder,
};
pub use store::QueueStore;
pub use sweeper::{RecoverySweeper, SweepReport};
