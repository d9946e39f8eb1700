//! Bounded executor for remote-service calls.
//!
//! Remote calls never run on the engine task. Each call is spawned as a
//! tokio task gated by a semaphore, so at most `slots` calls are in flight
//! against the rate-limited remote service at any time. A job's only output
//! is the completion message it sends back to the engine; the pool itself
//! holds no session state.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::debug;
use ulid::Ulid;

/// Default number of concurrently executing remote calls.
pub const DEFAULT_WORKER_SLOTS: usize = 4;

/// Bounded pool of remote-call executors.
#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool with the given number of concurrent slots.
    ///
    /// Zero is treated as one: a pool that can never run anything would
    /// deadlock every caller waiting on a completion.
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots.max(1))),
        }
    }

    /// Submit a job.
    ///
    /// The job starts once a slot frees up; submission itself never waits.
    /// A stalled remote call occupies one slot until it returns.
    pub fn submit<F>(&self, job: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slots = self.slots.clone();
        let job_id = Ulid::new().to_string();

        tokio::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(job_id = %job_id, job, "Worker pool closed, dropping job");
                    return;
                }
            };

            let started = Instant::now();
            debug!(job_id = %job_id, job, "Remote job started");
            fut.await;
            debug!(
                job_id = %job_id,
                job,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Remote job finished"
            );
        });
    }
}
