//! The deferred-work queue.
//!
//! Watch-loop handlers must never block on heavy repair work, so they
//! submit typed jobs onto an in-process queue and a single worker drains
//! it. Jobs that must not run twice concurrently (the timeline repair,
//! the disk GC) take a named exclusive lock first, which also keeps
//! multiple worker processes from colliding.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::lock::ExclusiveLock;
use crate::pstorage::PersistentStorage;
use crate::store::{timeline, DbPool};

/// Queue capacity; submissions beyond it are dropped with a log line
/// rather than blocking an event handler.
const QUEUE_DEPTH: usize = 64;

/// Lock TTL for exclusive jobs.
const JOB_LOCK_TTL: Duration = Duration::from_secs(600);

/// A deferred job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Job {
    /// Heavy container-timeline repair, scheduled when an event handler
    /// finds more than one open row for a container.
    FixPodsTimeline,
    /// One persistent-disk GC cycle.
    PersistentDiskGc,
}

impl Job {
    fn lock_name(&self) -> &'static str {
        match self {
            Job::FixPodsTimeline => "job.fix-pods-timeline",
            Job::PersistentDiskGc => "job.persistent-disk-gc",
        }
    }
}

/// The submission half.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
}

impl JobQueue {
    /// Submit a job; drops (with a warning) when the queue is saturated,
    /// since every job here is safe to re-submit later.
    pub fn submit(&self, job: Job) {
        if let Err(e) = self.sender.try_send(job) {
            warn!(error = %e, "job queue full, submission dropped");
        }
    }
}

/// The worker half.
pub struct JobWorker {
    receiver: mpsc::Receiver<Job>,
    db: DbPool,
    pstorage: PersistentStorage,
    locks: ExclusiveLock,
}

/// Build a connected queue/worker pair.
pub fn job_channel(
    db: DbPool,
    pstorage: PersistentStorage,
    locks: ExclusiveLock,
) -> (JobQueue, JobWorker) {
    let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
    (
        JobQueue { sender },
        JobWorker {
            receiver,
            db,
            pstorage,
            locks,
        },
    )
}

impl JobWorker {
    /// Drain jobs until every queue handle is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.receiver.recv().await {
            let lock = match self
                .locks
                .acquire(job.lock_name(), Some(JOB_LOCK_TTL), None)
                .await
            {
                Ok(Some(handle)) => handle,
                Ok(None) => {
                    // Another worker is already on it.
                    continue;
                }
                Err(e) => {
                    error!(error = %e, ?job, "could not take job lock");
                    continue;
                }
            };

            let outcome = match &job {
                Job::FixPodsTimeline => timeline::heavy_repair(&self.db).await.map(|repaired| {
                    info!(repaired, "timeline repair pass finished");
                }),
                Job::PersistentDiskGc => self.pstorage.gc().await,
            };
            if let Err(e) = outcome {
                error!(error = %e, ?job, "job failed");
            }
            if let Err(e) = self.locks.release(&lock).await {
                error!(error = %e, ?job, "could not release job lock");
            }
        }
    }
}
