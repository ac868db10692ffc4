//! The polling dispatcher.
//!
//! A single long-running task: sweep the cancellation flags of running jobs,
//! claim the oldest pending job, and spawn an independent runner task for
//! it. The claim is a plain read, so the dispatcher keeps an in-process set
//! of job ids it has already spawned and skips them until the runner marks
//! the row running.

use chrono::Utc;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use rapidflow_core::JobStatus;
use rapidflow_db::Store;

use crate::cancel::CancellationRegistry;
use crate::runner::JobRunner;

const IDLE_POLL: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

pub struct Dispatcher {
    store: Store,
    runner: Arc<JobRunner>,
    cancellations: Arc<CancellationRegistry>,
    inflight: Arc<Mutex<HashSet<i64>>>,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        runner: Arc<JobRunner>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            store,
            runner,
            cancellations,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run the dispatch loop forever.
    pub async fn run(&self) {
        info!("dispatcher started");
        loop {
            self.tick().await;
        }
    }

    /// One dispatch round; separated out so tests can drive it.
    pub async fn tick(&self) {
        // Fire cancel handles for running jobs whose flag was raised.
        match self.store.running_cancelled_jobs().await {
            Ok(job_ids) => {
                for job_id in job_ids {
                    self.cancellations.cancel(job_id);
                }
            }
            Err(e) => {
                error!(error = %e, "cancellation sweep failed");
                sleep(ERROR_BACKOFF).await;
                return;
            }
        }

        let claimed = match self.store.claim_next_pending().await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "pending poll failed");
                sleep(ERROR_BACKOFF).await;
                return;
            }
        };

        let Some(job) = claimed else {
            sleep(IDLE_POLL).await;
            return;
        };

        {
            let mut inflight = self.inflight.lock().expect("inflight set poisoned");
            if !inflight.insert(job.id) {
                // Already spawned; the row just hasn't left pending yet.
                drop(inflight);
                sleep(IDLE_POLL).await;
                return;
            }
        }

        info!(job_id = job.id, "claimed pending job");
        let runner = self.runner.clone();
        let store = self.store.clone();
        let inflight = self.inflight.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run(job.id).await {
                warn!(job_id = job.id, error = %e, "job run returned error");
                best_effort_fail(&store, job.id).await;
            }
            inflight.lock().expect("inflight set poisoned").remove(&job.id);
        });
    }
}

/// Backstop for runner errors that escaped without a terminal settle.
/// Terminal statuses stay sticky.
async fn best_effort_fail(store: &Store, job_id: i64) {
    let terminal = match store.job(job_id).await {
        Ok(job) => JobStatus::from_str(&job.status)
            .map(|s| s.is_terminal())
            .unwrap_or(false),
        Err(_) => false,
    };
    if terminal {
        return;
    }
    if let Err(e) = store
        .set_job_status(job_id, JobStatus::Failed, Some(Utc::now()))
        .await
    {
        warn!(job_id, error = %e, "failed to mark job failed");
    }
}
