/// Builder wiring a worker pool from its collaborators.
pub mod builder;
/// Single-job execution from ownership to a terminal or queued state.
pub mod executor;
/// Worker pool supervision, dispatch loop and shutdown.
pub mod supervisor;
/// Worker configuration.
pub mod worker;

pub use builder::WorkerPoolBuilder;
pub use executor::{JobError, JobExecutor, JobOutcome};
pub use supervisor::{ActiveJob, ShutdownToken, WorkerPool};
pub use worker::WorkerConfig;
