//! Process-wide cancellation registry.
//!
//! Maps running job ids to their cancellation handles. Writers are executor
//! entry and exit; readers are the external cancel API and the dispatcher
//! sweep. Cancellation is cooperative and idempotent.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CancellationRegistry {
    handles: Mutex<HashMap<i64, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh handle for a job entering execution. A stale handle
    /// for the same id is replaced.
    pub fn register(&self, job_id: i64) -> CancellationToken {
        let token = CancellationToken::new();
        self.handles
            .lock()
            .expect("cancellation registry poisoned")
            .insert(job_id, token.clone());
        token
    }

    /// Drop the handle on executor exit.
    pub fn remove(&self, job_id: i64) {
        self.handles
            .lock()
            .expect("cancellation registry poisoned")
            .remove(&job_id);
    }

    /// Fire the handle for a job. Returns `false` when the job is not
    /// running in this process.
    pub fn cancel(&self, job_id: i64) -> bool {
        let handles = self.handles.lock().expect("cancellation registry poisoned");
        match handles.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether an executor currently holds this job.
    pub fn is_running(&self, job_id: i64) -> bool {
        self.handles
            .lock()
            .expect("cancellation registry poisoned")
            .contains_key(&job_id)
    }
}
