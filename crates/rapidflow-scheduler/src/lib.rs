//! The RapidFlow job execution engine.
//!
//! This crate contains:
//! - [`JobRunner`], the per-job state machine driving container lifecycle,
//!   source acquisition, step execution and the runnable/deployment phases
//! - [`Dispatcher`], the polling loop claiming pending jobs
//! - [`CancellationRegistry`], the process-wide `job id → cancel handle` map
//! - The repo cloner, job submission and the stop-pipeline sweep

pub mod cancel;
pub mod dispatcher;
pub mod git;
pub mod runner;
pub mod stop;
pub mod submit;

pub use cancel::CancellationRegistry;
pub use dispatcher::Dispatcher;
pub use runner::JobRunner;
pub use stop::stop_pipeline;
pub use submit::{submit_job, validate_config};

use rapidflow_db::Store;

/// Request cancellation of a job: raise the persistent flag, then fire the
/// in-process handle when the job is running here. Returns `false` when no
/// executor holds the job in this process; the dispatcher sweep picks the
/// flag up on its next tick.
pub async fn cancel_job(
    store: &Store,
    cancellations: &CancellationRegistry,
    job_id: i64,
) -> rapidflow_core::Result<bool> {
    store.mark_cancelled(job_id).await?;
    Ok(cancellations.cancel(job_id))
}
