//! Job Queue & Scheduler (C1). Grounded in the teacher's `Task`/`TaskResult`
//! builder and backoff shape (`gateway/src/task.rs`) and its worker drain
//! loop (`gateway/src/worker.rs`), adapted from "drive one project's state
//! machine to completion" into "hold a durable FIFO of pending jobs with
//! leases, a rate limit, and retries" — the part of those two files that
//! is generic scheduling machinery rather than project-state-machine
//! specific. The per-queue rolling rate limit reuses the "bounded window
//! of recent `Instant`s, pruned on every check" shape the teacher's build
//! queue client uses when throttling against a remote build-slot service
//! (`deployer/src/deployment/queue.rs`'s `wait_for_queue`), here turned
//! into a local in-process gate since RenderLite has no separate queue
//! service to call out to.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Build,
    Rollback,
}

impl QueueName {
    fn as_str(self) -> &'static str {
        match self {
            QueueName::Build => "build-queue",
            QueueName::Rollback => "rollback-queue",
        }
    }
}

struct QueuedJob<P> {
    job_id: Uuid,
    payload: P,
    attempts: u32,
}

struct QueueState<P> {
    pending: VecDeque<QueuedJob<P>>,
    /// Every id currently pending *or* leased — enforces I5 (at most one
    /// job per deployment id across the queues at any time) without a
    /// separate leased-set scan.
    known_ids: HashSet<Uuid>,
    recent_leases: VecDeque<Instant>,
}

#[derive(Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub max_attempts: u32,
    /// Base delay for the retry backoff a `nack` sleeps through before
    /// requeuing (§4.1: "exponential backoff, base 1s"). Grows by the
    /// teacher's own `RunUntilDone` formula (`base * 3^tries`, capped at
    /// [`RETRY_BACKOFF_CAP_MS`]).
    pub retry_base_delay: Duration,
}

/// Upper bound on the backoff delay `nack` will sleep for, regardless of
/// how many attempts have already been made.
const RETRY_BACKOFF_CAP_MS: u64 = 30_000;

fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let growth = 3u64.saturating_pow(attempts.saturating_sub(1));
    let millis = (base.as_millis() as u64).saturating_mul(growth).min(RETRY_BACKOFF_CAP_MS);
    Duration::from_millis(millis)
}

/// A single logical queue (`build` or `rollback`). Durable enqueue, at-
/// least-once dequeue with an exclusive lease (the semaphore permit),
/// strict FIFO ordering, and a rolling rate limit independent of the
/// concurrency cap.
pub struct Queue<P> {
    name: QueueName,
    state: Mutex<QueueState<P>>,
    notify: Notify,
    permits: Semaphore,
    config: QueueConfig,
}

/// A leased job, returned by [`Queue::lease`]. Dropping it without calling
/// [`Lease::ack`] or [`Lease::nack`] simply leaves the permit released and
/// the id no longer tracked — acceptable only for tests; production code
/// always acks or nacks.
pub struct Lease<'q, P> {
    queue: &'q Queue<P>,
    job_id: Uuid,
    payload: Option<P>,
    attempts: u32,
    _permit: tokio::sync::SemaphorePermit<'q>,
}

impl<'q, P> Lease<'q, P> {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn payload(&self) -> &P {
        self.payload.as_ref().expect("payload taken")
    }

    /// Marks the job permanently complete (success or business-level
    /// failure — see the error-handling policy: only infrastructural
    /// errors are retried, business outcomes are recorded once).
    pub async fn ack(self) {
        let mut state = self.queue.state.lock().await;
        state.known_ids.remove(&self.job_id);
    }

    /// Requeues the job for another attempt if attempts remain, otherwise
    /// acks it as abandoned. Sleeps through the attempt's backoff delay
    /// first (still holding this lease's concurrency permit, so a backing-
    /// off retry counts against the queue's own concurrency cap rather than
    /// starving other queues). Returns whether it was requeued.
    pub async fn nack(mut self) -> bool {
        let payload = self.payload.take().expect("payload taken");

        if self.attempts >= self.queue.config.max_attempts {
            let mut state = self.queue.state.lock().await;
            state.known_ids.remove(&self.job_id);
            warn!(job_id = %self.job_id, attempts = self.attempts, "job exhausted retries");
            return false;
        }

        let delay = backoff_delay(self.queue.config.retry_base_delay, self.attempts);
        tokio::time::sleep(delay).await;

        let mut state = self.queue.state.lock().await;
        state.pending.push_back(QueuedJob {
            job_id: self.job_id,
            payload,
            attempts: self.attempts,
        });
        drop(state);
        self.queue.notify.notify_one();
        true
    }
}

impl<P> Queue<P> {
    pub fn new(name: QueueName, config: QueueConfig) -> Self {
        let permits = Semaphore::new(config.concurrency);
        Self {
            name,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                known_ids: HashSet::new(),
                recent_leases: VecDeque::new(),
            }),
            notify: Notify::new(),
            permits,
            config,
        }
    }

    /// Enqueues `payload` under `job_id`. Fails with `Conflict` if a job
    /// with that id is already pending or leased (I5).
    #[instrument(skip(self, payload), fields(queue = self.name.as_str(), job_id = %job_id))]
    pub async fn enqueue(&self, job_id: Uuid, payload: P) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.known_ids.insert(job_id) {
            return Err(Error::Conflict(format!(
                "job {job_id} already pending on {}",
                self.name.as_str()
            )));
        }
        state.pending.push_back(QueuedJob {
            job_id,
            payload,
            attempts: 0,
        });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Removes a still-pending job. Only succeeds while queued; a job that
    /// has already been leased (is mid-processing) is untouched — matches
    /// the spec's note that running jobs aren't interrupted here.
    pub async fn remove(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|j| j.job_id != job_id);
        let removed = state.pending.len() != before;
        if removed {
            state.known_ids.remove(&job_id);
        }
        Ok(removed)
    }

    /// True if `job_id` is still pending (not yet leased).
    pub async fn contains(&self, job_id: Uuid) -> bool {
        let state = self.state.lock().await;
        state.pending.iter().any(|j| j.job_id == job_id)
    }

    /// Waits for a concurrency permit, then for the rolling rate limit
    /// window to allow another lease, then pops the head of the FIFO.
    /// Blocks (does not busy-poll) until a job is available.
    pub async fn lease(&self) -> Lease<'_, P> {
        let permit = self.permits.acquire().await.expect("semaphore not closed");

        loop {
            self.wait_for_rate_limit().await;

            let mut state = self.state.lock().await;
            if let Some(job) = state.pending.pop_front() {
                state.recent_leases.push_back(Instant::now());
                drop(state);
                return Lease {
                    queue: self,
                    job_id: job.job_id,
                    payload: Some(job.payload),
                    attempts: job.attempts + 1,
                    _permit: permit,
                };
            }
            drop(state);

            self.notify.notified().await;
        }
    }

    async fn wait_for_rate_limit(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                while state
                    .recent_leases
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > self.config.rate_window)
                {
                    state.recent_leases.pop_front();
                }

                if (state.recent_leases.len() as u32) < self.config.rate_limit {
                    None
                } else {
                    let oldest = *state.recent_leases.front().expect("len checked above");
                    Some(self.config.rate_window.saturating_sub(now.duration_since(oldest)))
                }
            };

            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}

/// A pair of queues plus their shared scheduling config, wired together the
/// way the teacher's `DeploymentManager` wires its queue/run channels —
/// one long-lived struct a worker process holds for the lifetime of the
/// program.
pub struct Scheduler<P> {
    pub build: Arc<Queue<P>>,
    pub rollback: Arc<Queue<P>>,
}

impl<P> Scheduler<P> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            build: Arc::new(Queue::new(QueueName::Build, config.clone())),
            rollback: Arc::new(Queue::new(QueueName::Rollback, config)),
        }
    }

    pub fn queue(&self, name: QueueName) -> &Arc<Queue<P>> {
        match name {
            QueueName::Build => &self.build,
            QueueName::Rollback => &self.rollback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> QueueConfig {
        QueueConfig {
            concurrency: 2,
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_job_id() {
        let queue = Queue::new(QueueName::Build, test_config());
        let id = Uuid::new_v4();
        queue.enqueue(id, "payload-a").await.unwrap();
        assert!(queue.enqueue(id, "payload-b").await.is_err());
    }

    #[tokio::test]
    async fn lease_returns_jobs_in_fifo_order() {
        let queue = Queue::new(QueueName::Build, test_config());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.enqueue(first, "first").await.unwrap();
        queue.enqueue(second, "second").await.unwrap();

        let lease_a = queue.lease().await;
        assert_eq!(lease_a.job_id(), first);
        lease_a.ack().await;

        let lease_b = queue.lease().await;
        assert_eq!(lease_b.job_id(), second);
        lease_b.ack().await;
    }

    #[tokio::test]
    async fn remove_only_succeeds_while_pending() {
        let queue = Queue::new(QueueName::Build, test_config());
        let id = Uuid::new_v4();
        queue.enqueue(id, "payload").await.unwrap();

        assert!(queue.remove(id).await.unwrap());
        assert!(!queue.contains(id).await);

        // Re-enqueue under the same id now succeeds, since remove cleared
        // it from `known_ids` too.
        queue.enqueue(id, "payload-again").await.unwrap();
    }

    #[tokio::test]
    async fn nack_requeues_until_attempts_exhausted() {
        let mut config = test_config();
        config.max_attempts = 2;
        let queue = Queue::new(QueueName::Build, config);
        let id = Uuid::new_v4();
        queue.enqueue(id, "payload").await.unwrap();

        let lease1 = queue.lease().await;
        assert!(lease1.nack().await, "first nack should requeue");

        let lease2 = queue.lease().await;
        assert!(!lease2.nack().await, "second nack should exhaust retries");

        assert!(!queue.contains(id).await);
    }

    #[test]
    fn backoff_delay_grows_by_three_and_is_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(3));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(9));
        assert_eq!(backoff_delay(base, 10), Duration::from_millis(RETRY_BACKOFF_CAP_MS));
    }

    #[tokio::test]
    async fn concurrency_limit_bounds_simultaneous_leases() {
        let mut config = test_config();
        config.concurrency = 1;
        let queue = Arc::new(Queue::new(QueueName::Build, config));

        let first_id = Uuid::new_v4();
        queue.enqueue(first_id, "first").await.unwrap();
        let lease = queue.lease().await;

        let second_id = Uuid::new_v4();
        queue.enqueue(second_id, "second").await.unwrap();

        let queue_clone = queue.clone();
        let handle = tokio::spawn(async move { queue_clone.lease().await.job_id() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "second lease should block on the permit");

        lease.ack().await;
        let second_job_id = handle.await.unwrap();
        assert_eq!(second_job_id, second_id);
    }
}
