//! Idempotent job queue with retry backoff and dead-letter handling.
//!
//! The queue is an explicit in-process state machine
//! (`Queued → Active → {Succeeded | Retrying → Queued | DeadLettered}`)
//! independent of any broker. Job identity is derived from the record, not
//! generated, so re-enqueueing the same input batch after a crash produces no
//! duplicate work. State transitions are atomic per job: claiming marks a job
//! `Active` under the queue lock, so two workers can never own the same job.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use ditta_shared::{
    AttemptRecord, CompanyRecord, CorrelationId, DefaultsConfig, DittaError, EnrichmentResult,
    JobState, ReasonCode, RecordId, ResolutionJob, Result,
};

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

/// Retry policy for the queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Base retry delay; the actual delay is `base * 2^attempt` plus jitter.
    pub backoff_base: Duration,
    /// Cap on the computed retry delay.
    pub backoff_cap: Duration,
    /// Upper bound on the random jitter added to each retry delay.
    pub jitter: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&DefaultsConfig::default())
    }
}

impl From<&DefaultsConfig> for QueueConfig {
    fn from(config: &DefaultsConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue internals
// ---------------------------------------------------------------------------

/// A dead-lettered job with its final reason code. Inspectable, never
/// auto-retried.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub job: ResolutionJob,
    pub reason: ReasonCode,
}

/// Snapshot of queue state for run summaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub dead_lettered: usize,
}

struct QueueInner {
    jobs: HashMap<RecordId, ResolutionJob>,
    ready: VecDeque<RecordId>,
    delayed: BinaryHeap<Reverse<(Instant, RecordId)>>,
    dead: Vec<DeadLetter>,
}

enum Claim {
    Job(Box<ResolutionJob>),
    WaitUntil(Instant),
    WaitForWork,
    Drained,
}

/// In-process job queue shared by the scheduler and all workers.
pub struct JobQueue {
    config: QueueConfig,
    correlation_id: CorrelationId,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl JobQueue {
    pub fn new(config: QueueConfig, correlation_id: CorrelationId) -> Self {
        Self {
            config,
            correlation_id,
            inner: Mutex::new(QueueInner {
                jobs: HashMap::new(),
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                dead: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Enqueue one record. Idempotent: the job id is derived from the record,
    /// and re-enqueueing a known record returns the existing job's id without
    /// creating duplicate work.
    pub fn enqueue(&self, record: CompanyRecord) -> RecordId {
        let id = record.record_id();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        if inner.jobs.contains_key(&id) {
            debug!(job_id = %id, "record already enqueued, reusing job");
            return id;
        }

        let job = ResolutionJob {
            id: id.clone(),
            record,
            attempt: 0,
            max_attempts: self.config.max_attempts,
            correlation_id: self.correlation_id.clone(),
            state: JobState::Queued,
            history: Vec::new(),
        };
        inner.jobs.insert(id.clone(), job);
        inner.ready.push_back(id.clone());
        drop(inner);

        self.notify.notify_waiters();
        id
    }

    /// Pull the next queued job, suspending while retries are pending. Returns
    /// `None` once every job has reached a terminal state (the batch is
    /// drained). Claiming is atomic: the job flips to `Active` under the lock,
    /// so it has exactly one owner.
    pub async fn dispatch(&self) -> Option<ResolutionJob> {
        loop {
            match self.try_claim() {
                Claim::Job(job) => {
                    info!(job_id = %job.id, attempt = job.attempt, "job dispatched");
                    return Some(*job);
                }
                Claim::WaitUntil(due) => {
                    let wait = due.saturating_duration_since(Instant::now());
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                Claim::WaitForWork => {
                    self.notify.notified().await;
                }
                Claim::Drained => return None,
            }
        }
    }

    fn try_claim(&self) -> Claim {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let now = Instant::now();

        // Promote due retries.
        loop {
            let due_now = matches!(
                inner.delayed.peek(),
                Some(Reverse((due, _))) if *due <= now
            );
            if !due_now {
                break;
            }
            let Some(Reverse((_, id))) = inner.delayed.pop() else {
                break;
            };
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.state = JobState::Queued;
            }
            inner.ready.push_back(id);
        }

        if let Some(id) = inner.ready.pop_front() {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.state = JobState::Active;
                job.attempt += 1;
                return Claim::Job(Box::new(job.clone()));
            }
        }

        if let Some(Reverse((due, _))) = inner.delayed.peek() {
            return Claim::WaitUntil(*due);
        }

        // Active jobs may still fail and re-queue; wait for their verdicts.
        if inner
            .jobs
            .values()
            .any(|j| j.state == JobState::Active)
        {
            return Claim::WaitForWork;
        }

        Claim::Drained
    }

    /// Mark a job succeeded. Only the owning worker calls this.
    pub fn complete(&self, id: &RecordId, result: &EnrichmentResult) -> Result<()> {
        if !result.accounts_for_all_fields() {
            return Err(DittaError::logic(
                "refusing to complete a job whose result does not account for every field",
            ));
        }

        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| DittaError::logic(format!("complete for unknown job {id}")))?;
        if job.state != JobState::Active {
            return Err(DittaError::logic(format!(
                "complete for job {id} in state {}",
                job.state
            )));
        }

        job.state = JobState::Succeeded;
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Record a failed attempt. Transient errors re-queue with exponential
    /// backoff until `max_attempts`; non-transient errors (validation) force
    /// the attempt counter to the cap and dead-letter immediately. Returns the
    /// job's new state.
    pub fn fail(&self, id: &RecordId, error: &DittaError) -> Result<JobState> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| DittaError::logic(format!("fail for unknown job {id}")))?;
        if job.state != JobState::Active {
            return Err(DittaError::logic(format!(
                "fail for job {id} in state {}",
                job.state
            )));
        }

        job.history.push(AttemptRecord {
            attempt: job.attempt,
            error: error.to_string(),
            at: Utc::now(),
        });

        // A structurally invalid record is not worth retrying.
        if !error.is_transient() {
            job.attempt = job.max_attempts;
        }

        let new_state = if job.attempt >= job.max_attempts {
            job.state = JobState::DeadLettered;
            let reason = if matches!(error, DittaError::Validation { .. }) {
                ReasonCode::InvalidRecord
            } else {
                ReasonCode::MaxAttemptsExceeded
            };
            let letter = DeadLetter {
                job: job.clone(),
                reason,
            };
            warn!(job_id = %id, reason = %reason, attempts = job.attempt, "job dead-lettered");
            inner.dead.push(letter);
            JobState::DeadLettered
        } else {
            job.state = JobState::Retrying;
            let delay = self.retry_delay(job.attempt);
            debug!(job_id = %id, attempt = job.attempt, delay_ms = delay.as_millis() as u64, "job re-queued");
            let due = Instant::now() + delay;
            let id = id.clone();
            inner.delayed.push(Reverse((due, id)));
            JobState::Retrying
        };

        drop(inner);
        self.notify.notify_waiters();
        Ok(new_state)
    }

    /// `base * 2^attempt` with jitter, capped.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(self.config.backoff_cap);
        let jitter_max = self.config.jitter.as_millis() as u64;
        if jitter_max == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_max))
    }

    /// Snapshot a job's current state (including accumulated history).
    pub fn get(&self, id: &RecordId) -> Option<ResolutionJob> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .jobs
            .get(id)
            .cloned()
    }

    /// The dead-letter queue, inspectable but never auto-retried.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .dead
            .clone()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            match job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Active => stats.active += 1,
                JobState::Retrying => stats.retrying += 1,
                JobState::Succeeded => stats.succeeded += 1,
                JobState::DeadLettered => stats.dead_lettered += 1,
            }
        }
        stats
    }
}
