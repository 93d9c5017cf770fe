//! Drift-corrected periodic scheduling of jobs.
//!
//! The [`Scheduler`] drives every registered [`Job`] from a single loop. Each
//! job is anchored at the instant it was registered and fires at
//! `anchor + k * interval`. After a firing the next deadline is computed from
//! the previous *deadline*, not from the time the job finished, so firings
//! stay phase-locked to the anchor. Deadlines missed while a job overran are
//! skipped, never replayed.
//!
//! Jobs run one at a time: while a job runs nothing else fires. The shutdown
//! signal is observed only between jobs, so a running job always completes.

use std::{cmp::Reverse, collections::BinaryHeap, fmt, time::Duration};

use async_trait::async_trait;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

/// Error type jobs may return to abort the scheduler.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Scheduler`]
pub enum Error {
    /// A job returned an error, terminating the scheduler.
    #[error("Job {name} failed: {source}")]
    Job {
        /// Name of the failed job
        name: String,
        /// Error returned by the job
        #[source]
        source: JobError,
    },
}

#[async_trait]
/// A unit of periodic work.
pub trait Job: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;
    /// Run one firing of this job. Returning an error stops the scheduler.
    async fn tick(&mut self) -> Result<(), JobError>;
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Compute the deadline following `anchor`.
///
/// The result is the smallest `anchor + m * interval`, `m >= 1`, lying
/// strictly after `now`. Returns `None` when that instant is not
/// representable.
#[must_use]
pub fn next_tick(anchor: Instant, interval: Duration, now: Instant) -> Option<Instant> {
    if interval.is_zero() {
        return Some(now);
    }
    let step = interval.as_nanos();
    let elapsed = now.saturating_duration_since(anchor).as_nanos();
    let offset = (elapsed / step + 1).checked_mul(step)?;
    let secs = u64::try_from(offset / NANOS_PER_SEC).ok()?;
    let nanos = u32::try_from(offset % NANOS_PER_SEC).ok()?;
    anchor.checked_add(Duration::new(secs, nanos))
}

/// Single-loop scheduler for periodic jobs.
pub struct Scheduler {
    jobs: Vec<(Duration, Box<dyn Job>)>,
    /// Pending deadlines: (deadline, sequence, index into `jobs`). The
    /// sequence number breaks ties in registration order.
    queue: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    sequence: u64,
    shutdown: sql_exporter_signal::Watcher,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let jobs: Vec<(&str, Duration)> = self
            .jobs
            .iter()
            .map(|(interval, job)| (job.name(), *interval))
            .collect();
        f.debug_struct("Scheduler")
            .field("jobs", &jobs)
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a new [`Scheduler`] that stops when `shutdown` fires.
    #[must_use]
    pub fn new(shutdown: sql_exporter_signal::Watcher) -> Self {
        Self {
            jobs: Vec::new(),
            queue: BinaryHeap::new(),
            sequence: 0,
            shutdown,
        }
    }

    /// Register `job` to fire every `interval`, first firing now.
    pub fn schedule(&mut self, interval: Duration, job: Box<dyn Job>) {
        let slot = self.jobs.len();
        debug!("scheduling {} every {interval:?}", job.name());
        self.jobs.push((interval, job));
        self.enqueue(Instant::now(), slot);
    }

    /// Number of registered jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn enqueue(&mut self, at: Instant, slot: usize) {
        self.queue.push(Reverse((at, self.sequence, slot)));
        self.sequence += 1;
    }

    /// Run this [`Scheduler`] to completion
    ///
    /// Fires jobs as they come due until the shutdown signal is received.
    ///
    /// # Errors
    ///
    /// Function will return an error if any job returns an error.
    pub async fn run(mut self) -> Result<(), Error> {
        if self.jobs.is_empty() {
            info!("no jobs scheduled, scheduler exiting");
            return Ok(());
        }

        let shutdown_wait = self.shutdown.clone().recv();
        tokio::pin!(shutdown_wait);

        while let Some(Reverse((deadline, _, slot))) = self.queue.pop() {
            tokio::select! {
                biased;

                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return Ok(());
                }
                () = sleep_until(deadline) => {}
            }

            let interval = self.jobs[slot].0;
            let job = &mut self.jobs[slot].1;
            if let Err(source) = job.tick().await {
                let name = job.name().to_string();
                error!("job {name} failed, stopping scheduler: {source}");
                return Err(Error::Job { name, source });
            }

            match next_tick(deadline, interval, Instant::now()) {
                Some(next) => self.enqueue(next, slot),
                None => warn!(
                    "job {} has no representable next deadline, not rescheduling",
                    self.jobs[slot].1.name()
                ),
            }
        }

        Ok(())
    }
}
