use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobPoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for JobPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job queue is full")]
    QueueFull,
    #[error("job pool is shut down")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct JobStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

struct Job {
    name: String,
    future: JobFuture,
    done: oneshot::Sender<JobOutcome>,
}

/// Handle to one accepted job.
pub struct JobTicket {
    name: String,
    rx: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn wait(self) -> JobOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| JobOutcome::Failed("job was dropped before completing".into()))
    }
}

/// Fixed set of workers draining a bounded queue of background jobs.
pub struct JobPool {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl JobPool {
    /// Spawns the workers; must be called inside a tokio runtime.
    pub fn new(config: JobPoolConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        run_job(worker, job, &counters).await;
                    }
                    debug!(worker, "job worker stopped");
                })
            })
            .collect();

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(workers),
            counters,
        }
    }

    /// Queues `future` without waiting; fails fast when the queue is full.
    pub fn submit<F>(&self, name: impl Into<String>, future: F) -> Result<JobTicket, JobError>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let tx = self.tx.lock().clone().ok_or(JobError::Closed)?;
        let (done, rx) = oneshot::channel();
        let job = Job {
            name: name.clone(),
            future: Box::pin(future),
            done,
        };
        match tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(JobTicket { name, rx })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(job = %name, "job queue full, job rejected");
                Err(JobError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(JobError::Closed),
        }
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stops intake, lets queued jobs finish, then waits for every worker.
    pub async fn shutdown(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "job worker ended abnormally");
            }
        }
    }
}

async fn run_job(worker: usize, job: Job, counters: &Counters) {
    let Job { name, future, done } = job;
    let outcome = match tokio::spawn(future).await {
        Ok(Ok(())) => JobOutcome::Succeeded,
        Ok(Err(error)) => JobOutcome::Failed(format!("{error:#}")),
        Err(error) => JobOutcome::Failed(format!("job panicked: {error}")),
    };
    match &outcome {
        JobOutcome::Succeeded => {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
            debug!(worker, job = %name, "job succeeded");
        }
        JobOutcome::Failed(reason) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(worker, job = %name, %reason, "job failed");
        }
    }
    let _ = done.send(outcome);
}
