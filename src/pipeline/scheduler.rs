//! Bounded-concurrency job admission.
//!
//! Jobs are admitted FIFO up to the concurrency limit and run as detached tasks.
//! A job's outcome is only logged here; classifying failures belongs to whoever built
//! the job.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_CONCURRENCY: usize = 3;
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

type JobAction = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Category tag shown next to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Track,
    Album,
    Retry,
}

pub struct Job {
    id: String,
    title: String,
    kind: JobKind,
    cancel: CancellationToken,
    action: JobAction,
}

impl Job {
    pub fn new<F, Fut>(title: impl Into<String>, kind: JobKind, action: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            kind,
            cancel: CancellationToken::new(),
            action: Box::new(move |token| action(token).boxed()),
        }
    }

    /// Uses `token` as this job's cancellation handle.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn info(&self, running: bool) -> JobInfo {
        JobInfo {
            id: self.id.clone(),
            title: self.title.clone(),
            kind: self.kind,
            running,
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Queue listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub title: String,
    pub kind: JobKind,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    QueueChanged { pending: usize, running: usize },
    Idle,
}

struct SchedulerState {
    pending: VecDeque<Job>,
    running: HashMap<String, (JobInfo, CancellationToken)>,
    /// Admission order of running jobs, for listing.
    running_order: Vec<String>,
    limit: usize,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<SchedulerEvent>,
    idle: watch::Sender<bool>,
}

/// Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobScheduler {
    pub fn new(limit: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    pending: VecDeque::new(),
                    running: HashMap::new(),
                    running_order: Vec::new(),
                    limit: limit.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY),
                }),
                events,
                idle,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Queues `job` and admits what the limit allows. Returns the job id.
    pub fn submit(&self, job: Job) -> String {
        let id = job.id.clone();
        debug!("Queued job {} ({})", id, job.title);
        {
            let mut state = lock(&self.inner.state);
            state.pending.push_back(job);
            self.inner.idle.send_replace(false);
        }
        self.emit_queue_changed();
        self.admit();
        id
    }

    /// Drops a job that has not started yet and cancels its token. Running jobs are
    /// left alone; returns whether anything was removed.
    pub fn remove(&self, job_id: &str) -> bool {
        let removed = {
            let mut state = lock(&self.inner.state);
            let position = state.pending.iter().position(|j| j.id == job_id);
            position.and_then(|p| state.pending.remove(p))
        };
        match removed {
            Some(job) => {
                info!("Removed pending job {} ({})", job.id, job.title);
                job.cancel.cancel();
                self.emit_queue_changed();
                self.check_idle();
                true
            }
            None => false,
        }
    }

    /// Triggers the cancellation token of a job, pending or running.
    pub fn cancel(&self, job_id: &str) -> bool {
        let token = {
            let state = lock(&self.inner.state);
            state
                .running
                .get(job_id)
                .map(|(_, token)| token.clone())
                .or_else(|| {
                    state
                        .pending
                        .iter()
                        .find(|j| j.id == job_id)
                        .map(|j| j.cancel.clone())
                })
        };
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Clamps `limit` to 1..=10. Running jobs are never preempted.
    pub fn set_concurrency_limit(&self, limit: usize) {
        let limit = limit.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        lock(&self.inner.state).limit = limit;
        info!("Concurrency limit set to {}", limit);
        self.admit();
    }

    pub fn concurrency_limit(&self) -> usize {
        lock(&self.inner.state).limit
    }

    pub fn running_count(&self) -> usize {
        lock(&self.inner.state).running.len()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Running jobs in admission order, then pending jobs in queue order.
    pub fn snapshot(&self) -> Vec<JobInfo> {
        let state = lock(&self.inner.state);
        state
            .running_order
            .iter()
            .filter_map(|id| state.running.get(id).map(|(info, _)| info.clone()))
            .chain(state.pending.iter().map(|job| job.info(false)))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.idle.borrow()
    }

    /// Resolves once nothing is running or pending.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    fn admit(&self) {
        let admitted: Vec<Job> = {
            let mut state = lock(&self.inner.state);
            let mut admitted = Vec::new();
            while state.running.len() < state.limit {
                let Some(job) = state.pending.pop_front() else {
                    break;
                };
                state
                    .running
                    .insert(job.id.clone(), (job.info(true), job.cancel.clone()));
                state.running_order.push(job.id.clone());
                admitted.push(job);
            }
            admitted
        };

        if admitted.is_empty() {
            return;
        }
        self.emit_queue_changed();
        for job in admitted {
            self.start(job);
        }
    }

    fn start(&self, job: Job) {
        let scheduler = self.clone();
        let Job {
            id,
            title,
            cancel,
            action,
            ..
        } = job;
        debug!("Starting job {} ({})", id, title);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(action(cancel)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => debug!("Job {} ({}) finished", id, title),
                Ok(Err(e)) => warn!("Job {} ({}) failed: {:#}", id, title, e),
                Err(_) => error!("Job {} ({}) panicked", id, title),
            }
            scheduler.finish(&id);
        });
    }

    fn finish(&self, job_id: &str) {
        {
            let mut state = lock(&self.inner.state);
            state.running.remove(job_id);
            state.running_order.retain(|id| id != job_id);
        }
        self.emit_queue_changed();
        self.admit();
        self.check_idle();
    }

    /// The idle flag only changes under the state lock, so it cannot contradict
    /// the queue.
    fn check_idle(&self) {
        let became_idle = {
            let state = lock(&self.inner.state);
            state.running.is_empty()
                && state.pending.is_empty()
                && !self.inner.idle.send_replace(true)
        };
        if became_idle {
            debug!("Scheduler idle");
            let _ = self.inner.events.send(SchedulerEvent::Idle);
        }
    }

    fn emit_queue_changed(&self) {
        let (pending, running) = {
            let state = lock(&self.inner.state);
            (state.pending.len(), state.running.len())
        };
        // No subscribers is fine.
        let _ = self
            .inner
            .events
            .send(SchedulerEvent::QueueChanged { pending, running });
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}
