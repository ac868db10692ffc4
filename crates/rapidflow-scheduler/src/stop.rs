//! The stop-pipeline sweep: the authoritative reclaimer for temporary jobs.
//!
//! Cancels any running executors, removes runnable containers by name and
//! build containers by id, deletes recorded temp directories, and moves
//! every touched job to `stopped`.

use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use rapidflow_core::{JobStatus, Result};
use rapidflow_db::Store;
use rapidflow_executor::ContainerRuntime;

use crate::cancel::CancellationRegistry;
use crate::submit::runnable_from_json;

pub async fn stop_pipeline(
    store: &Store,
    runtime: &Arc<dyn ContainerRuntime>,
    cancellations: &CancellationRegistry,
    pipeline_id: i64,
) -> Result<()> {
    let jobs = store.jobs_for_pipeline(pipeline_id).await?;
    info!(pipeline_id, jobs = jobs.len(), "stopping pipeline");

    for job in jobs {
        // The persistent flag is what an executor in another process
        // observes (via its dispatcher sweep); the local registry handle
        // only covers executors running here.
        store.mark_cancelled(job.id).await?;
        cancellations.cancel(job.id);

        // Runnable containers are addressed by their configured (or
        // defaulted) names.
        for runnable in store.runnables_for_job(job.id).await? {
            if runnable.runnable_type != "docker_container" {
                continue;
            }
            let container_name = runnable_from_json(&runnable.config)
                .ok()
                .and_then(|c| c.container_name)
                .unwrap_or_else(|| format!("rapidflow-run-{}-{}", job.id, runnable.name));
            if let Err(e) = runtime.remove_by_name(&container_name).await {
                warn!(job_id = job.id, container = %container_name, error = %e, "failed to remove runnable container");
            }
        }

        if let Some(container_id) = &job.container_id
            && let Err(e) = runtime.remove(container_id).await
        {
            // Non-temporary jobs already removed theirs on exit.
            debug!(job_id = job.id, container = %container_id, error = %e, "build container already gone");
        }

        if let Some(temp_dir) = &job.temp_dir {
            let _ = tokio::fs::remove_dir_all(temp_dir).await;
        }

        // Jobs that already settled keep their original finished stamp.
        let already_terminal = JobStatus::from_str(&job.status)
            .map(|s| s.is_terminal())
            .unwrap_or(false);
        let finished_at = if already_terminal {
            None
        } else {
            Some(Utc::now())
        };
        store
            .set_job_status(job.id, JobStatus::Stopped, finished_at)
            .await?;
        store.cancel_open_steps(job.id).await?;
    }

    Ok(())
}
