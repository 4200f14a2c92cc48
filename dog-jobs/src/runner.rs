use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use dog_core::{JsonSerializer, Serializer};
use dog_lock::{Lock, LockProvider};
use dog_queue::{EntryId, LeaseToken, Queue, QueueBackend, QueueEntry};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    JobContext, JobResult, JobRunnerOptions, JobsResult, QueueJob, RunOptions, WorkerHandle,
};

/// Pause after an infrastructure error before polling again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Totals from one [`QueueJobRunner::run_continuous`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Polls that found nothing to do
    pub idle: usize,
    /// Runs that hit an infrastructure error
    pub errors: usize,
}

impl RunSummary {
    fn record(&mut self, result: &JobResult) {
        match result {
            JobResult::Success { .. } => self.succeeded += 1,
            JobResult::Failed { .. } => self.failed += 1,
            JobResult::Cancelled { .. } => self.cancelled += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}

/// Pulls entries off a [`Queue`] and runs a [`QueueJob`] on each.
///
/// Each run: dequeue, lock the job's resource if it names one, keep both
/// leases alive while the job works, then complete on success or abandon
/// otherwise. Losing either lease cancels the job and the entry is
/// abandoned, never completed.
pub struct QueueJobRunner<J: QueueJob, S = JsonSerializer> {
    queue: Queue<J::Item, S>,
    job: Arc<J>,
    locks: Option<Arc<dyn LockProvider>>,
    options: JobRunnerOptions,
}

impl<J: QueueJob, S: Serializer> Clone for QueueJobRunner<J, S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            job: self.job.clone(),
            locks: self.locks.clone(),
            options: self.options.clone(),
        }
    }
}

impl<J, S> QueueJobRunner<J, S>
where
    J: QueueJob,
    S: Serializer,
{
    pub fn new(queue: Queue<J::Item, S>, job: J) -> Self {
        Self {
            queue,
            job: Arc::new(job),
            locks: None,
            options: JobRunnerOptions::default(),
        }
    }

    /// Lock provider used for jobs that return a `lock_key`
    pub fn with_locks(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_options(mut self, options: JobRunnerOptions) -> JobsResult<Self> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    pub fn queue(&self) -> &Queue<J::Item, S> {
        &self.queue
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn options(&self) -> &JobRunnerOptions {
        &self.options
    }

    /// Process at most one entry.
    ///
    /// `Ok(None)` when no entry arrived within `dequeue_wait` or `cancel`
    /// was already signalled.
    #[instrument(skip(self, cancel), fields(queue = %self.queue.name()))]
    pub async fn run_once(&self, cancel: &CancellationToken) -> JobsResult<Option<JobResult>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let Some(entry) = self.queue.dequeue(self.options.dequeue_wait).await? else {
            return Ok(None);
        };
        let entry = Arc::new(entry);
        debug!(entry_id = %entry.id, attempts = entry.attempts, "processing entry");

        let lock = match self.acquire_lock(&entry).await {
            Ok(LockOutcome::Unlocked) => None,
            Ok(LockOutcome::Held(locks, lock)) => Some((locks, lock)),
            Ok(LockOutcome::TimedOut) => {
                let result = JobResult::failed("unable to acquire lock");
                self.finish(&entry, &result).await?;
                return Ok(Some(result));
            }
            Err(err) => {
                self.finish(&entry, &JobResult::failed(err.to_string())).await?;
                return Err(err);
            }
        };

        let job_cancel = cancel.child_token();
        let ownership_lost = Arc::new(AtomicBool::new(false));
        let stop_renewal = CancellationToken::new();
        let renewal = self.spawn_renewal(&entry, lock.as_ref(), &job_cancel, &ownership_lost, &stop_renewal);

        let ctx = JobContext::new(
            entry.clone(),
            self.queue.name(),
            lock.as_ref().map(|(_, lock)| lock.resource.clone()),
            job_cancel.clone(),
        );
        let outcome = AssertUnwindSafe(self.job.process(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| JobResult::failed(format!("job panicked: {}", panic_message(&*panic))));

        stop_renewal.cancel();
        if let Err(err) = renewal.await {
            warn!(entry_id = %entry.id, error = %err, "lease renewal task failed");
        }

        let result = if ownership_lost.load(Ordering::SeqCst) {
            JobResult::cancelled(format!("ownership lost while processing ({outcome})"))
        } else {
            outcome
        };

        let finished = self.finish(&entry, &result).await;
        self.release_lock(lock.as_ref()).await;
        let result = match finished? {
            true => result,
            false => JobResult::cancelled("ownership lost before completion"),
        };

        match &result {
            JobResult::Success { .. } => info!(entry_id = %entry.id, "job succeeded"),
            JobResult::Failed { .. } => warn!(entry_id = %entry.id, attempts = entry.attempts, "job failed: {result}"),
            JobResult::Cancelled { .. } => warn!(entry_id = %entry.id, "job {result}"),
        }
        Ok(Some(result))
    }

    /// Keep running until `cancel` fires or a limit in `options` is reached.
    ///
    /// Infrastructure errors are logged and counted; the loop backs off and
    /// keeps going.
    #[instrument(skip(self, options, cancel), fields(queue = %self.queue.name()))]
    pub async fn run_continuous(&self, options: RunOptions, cancel: &CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();
        info!(?options, "job runner started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if options.iteration_limit.is_some_and(|limit| summary.iterations >= limit) {
                break;
            }

            let pause = match self.run_once(cancel).await {
                Ok(Some(result)) => {
                    summary.record(&result);
                    options.interval
                }
                Ok(None) => {
                    summary.idle += 1;
                    if options.until_empty {
                        summary.iterations += 1;
                        debug!("queue empty, stopping");
                        break;
                    }
                    options.interval
                }
                Err(err) => {
                    summary.errors += 1;
                    error!(error = %err, "job run failed");
                    options.interval.max(ERROR_BACKOFF)
                }
            };
            summary.iterations += 1;

            if !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(?summary, "job runner stopped");
        summary
    }

    /// Run continuously on a background task
    pub fn start(&self, options: RunOptions) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let runner = self.clone();
        let token = cancel.clone();
        let join_handle = tokio::spawn(async move { runner.run_continuous(options, &token).await });

        info!(queue = %self.queue.name(), "started job worker");
        WorkerHandle::new(cancel, join_handle)
    }

    async fn acquire_lock(&self, entry: &QueueEntry<J::Item>) -> JobsResult<LockOutcome> {
        let Some(resource) = self.job.lock_key(&entry.value) else {
            return Ok(LockOutcome::Unlocked);
        };
        let Some(locks) = &self.locks else {
            warn!(entry_id = %entry.id, resource = %resource, "job asked for a lock but no lock provider is configured");
            return Ok(LockOutcome::Unlocked);
        };

        match locks.acquire(&resource, self.options.lock).await? {
            Some(lock) => {
                debug!(entry_id = %entry.id, resource = %resource, waited = ?lock.time_waited, "lock acquired");
                Ok(LockOutcome::Held(locks.clone(), lock))
            }
            None => {
                debug!(entry_id = %entry.id, resource = %resource, "lock acquire timed out");
                Ok(LockOutcome::TimedOut)
            }
        }
    }

    fn spawn_renewal(
        &self,
        entry: &QueueEntry<J::Item>,
        lock: Option<&(Arc<dyn LockProvider>, Lock)>,
        job_cancel: &CancellationToken,
        ownership_lost: &Arc<AtomicBool>,
        stop: &CancellationToken,
    ) -> JoinHandle<()> {
        let queue_lease = (entry.lease_until - entry.dequeued_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let renewal = Renewal {
            backend: self.queue.backend().clone(),
            id: entry.id.clone(),
            token: entry.lease_token().clone(),
            queue_lease,
            lock: lock.cloned(),
            lock_lease: self.options.lock.lease,
            interval: self.options.renewal_interval_for(queue_lease, lock.is_some()),
            job_cancel: job_cancel.clone(),
            ownership_lost: ownership_lost.clone(),
        };
        tokio::spawn(renewal.run(stop.clone()))
    }

    /// Complete or abandon according to `result`.
    ///
    /// `Ok(false)` when the queue no longer considered this run the owner.
    async fn finish(&self, entry: &QueueEntry<J::Item>, result: &JobResult) -> JobsResult<bool> {
        if result.is_success() {
            let completed = self.queue.complete(entry).await?;
            if !completed {
                warn!(entry_id = %entry.id, "entry lease lost before completion, it will be redelivered");
            }
            return Ok(completed);
        }

        let reason = result.abandon_reason().unwrap_or_default();
        let abandoned = self.queue.abandon_with_reason(entry, reason).await?;
        if !abandoned {
            debug!(entry_id = %entry.id, "entry already reclaimed, abandon skipped");
        }
        // a reclaimed entry is redelivered either way
        Ok(true)
    }

    async fn release_lock(&self, lock: Option<&(Arc<dyn LockProvider>, Lock)>) {
        let Some((locks, lock)) = lock else {
            return;
        };
        match locks.release(lock).await {
            Ok(true) => debug!(resource = %lock.resource, "lock released"),
            Ok(false) => warn!(resource = %lock.resource, "lock was no longer held at release"),
            Err(err) => warn!(resource = %lock.resource, error = %err, "failed to release lock, it will expire"),
        }
    }
}

enum LockOutcome {
    /// The job runs without a lock
    Unlocked,
    Held(Arc<dyn LockProvider>, Lock),
    TimedOut,
}

/// Background lease keeper for one run
struct Renewal {
    backend: Arc<dyn QueueBackend>,
    id: EntryId,
    token: LeaseToken,
    queue_lease: Duration,
    lock: Option<(Arc<dyn LockProvider>, Lock)>,
    lock_lease: Duration,
    interval: Duration,
    job_cancel: CancellationToken,
    ownership_lost: Arc<AtomicBool>,
}

impl Renewal {
    async fn run(mut self, stop: CancellationToken) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }

            if !self.renew_once().await {
                self.ownership_lost.store(true, Ordering::SeqCst);
                self.job_cancel.cancel();
                return;
            }
        }
    }

    /// Renew the queue lease, then the lock; `false` once either is lost
    async fn renew_once(&mut self) -> bool {
        match self.backend.renew_lock(&self.id, &self.token, self.queue_lease).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(entry_id = %self.id, "queue lease lost, cancelling job");
                return false;
            }
            Err(err) => {
                warn!(entry_id = %self.id, error = %err, "queue lease renewal failed, cancelling job");
                return false;
            }
        }

        if let Some((locks, lock)) = self.lock.as_mut() {
            match locks.renew(lock, self.lock_lease).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(entry_id = %self.id, resource = %lock.resource, "lock lost, cancelling job");
                    return false;
                }
                Err(err) => {
                    warn!(entry_id = %self.id, resource = %lock.resource, error = %err, "lock renewal failed, cancelling job");
                    return false;
                }
            }
        }
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
