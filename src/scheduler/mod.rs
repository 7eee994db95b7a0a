//! The job scheduler: admission, deduplication, dispatch and fan-out.
//!
//! ## Shared state
//!
//! One mutex guards the job table: every record, the fingerprint → active
//! job map and the FIFO queue. `submit` performs its cache re-check,
//! dedup lookup, backpressure check and enqueue under that single lock, so
//! two identical submissions can never both create a job. The lock is never
//! held across an `.await` or a renderer call.
//!
//! Lock order is table → cache → artifact index. Workers publish a finished
//! artifact to the cache *before* retiring the job from the active map, so a
//! submission racing a completing build either joins the job or hits the
//! cache; it never starts a second render.
//!
//! ## Lineages
//!
//! A retry never revives a failed record. The worker creates a successor
//! record (`attempt + 1`), links the failed one to it through `retried_as`
//! and moves the waiters over. [`JobScheduler::status`] and
//! [`JobScheduler::await_result`] follow those links, so a caller holding
//! the first handle observes the lineage's latest state.
//!
//! ## Completion signal
//!
//! Each record owns a `tokio::sync::watch` sender carrying its state.
//! Awaiting callers subscribe and wait for a terminal value; every receiver
//! wakes on the same transition.

mod worker;

use crate::cache::ResultCache;
use crate::config::SchedulerConfig;
use crate::error::BuildError;
use crate::fingerprint::Fingerprint;
use crate::job::{CancelFlag, Handle, JobId, JobSnapshot, JobState};
use crate::progress::{NoopObserver, Observer};
use crate::renderer::Renderer;
use crate::request::BuildRequest;
use crate::store::{Artifact, ArtifactPin, ArtifactRef, ArtifactStore};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

/// A stream of state changes for one build lineage.
pub type StateStream = Pin<Box<dyn Stream<Item = JobState> + Send>>;

/// Counts returned by [`JobScheduler::purge_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub cache_entries: usize,
    pub job_records: usize,
    pub artifacts: usize,
}

/// Point-in-time load figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    /// Records in the table, finished ones included.
    pub jobs: usize,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub artifacts: usize,
}

// ── Job table ────────────────────────────────────────────────────────────

/// A successful outcome: the pin keeps the artifact alive while the record
/// is retained.
struct Finished {
    _pin: ArtifactPin,
    artifact: Artifact,
}

struct JobRecord {
    id: JobId,
    fingerprint: Fingerprint,
    request: Arc<BuildRequest>,
    state: JobState,
    attempt: u32,
    waiters: usize,
    created_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    outcome: Option<Result<Finished, BuildError>>,
    retried_as: Option<JobId>,
    cancel: CancelFlag,
    cancel_requested: bool,
    signal: watch::Sender<JobState>,
}

impl JobRecord {
    fn new(id: JobId, fingerprint: Fingerprint, request: Arc<BuildRequest>, attempt: u32, waiters: usize) -> Self {
        let (signal, _) = watch::channel(JobState::Queued);
        Self {
            id,
            fingerprint,
            request,
            state: JobState::Queued,
            attempt,
            waiters,
            created_at: Instant::now(),
            started_at: None,
            finished_at: None,
            outcome: None,
            retried_as: None,
            cancel: CancelFlag::new(),
            cancel_requested: false,
            signal,
        }
    }

    /// Move to `state` and wake every subscriber.
    fn transition(&mut self, state: JobState) {
        debug_assert!(!self.state.is_terminal(), "{} left terminal state", self.id);
        self.state = state;
        let now = Instant::now();
        match state {
            JobState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.signal.send_replace(state);
    }

    fn result(&self) -> Option<Result<Artifact, BuildError>> {
        match self.outcome.as_ref()? {
            Ok(finished) => Some(Ok(finished.artifact.clone())),
            Err(e) => Some(Err(e.clone())),
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        let queued_for = self
            .started_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.created_at);
        let running_for = self.started_at.map(|s| {
            self.finished_at
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(s)
        });
        let error = match &self.outcome {
            Some(Err(e)) => Some(e.to_string()),
            _ => None,
        };
        JobSnapshot {
            id: self.id.clone(),
            fingerprint: self.fingerprint,
            state: self.state,
            attempt: self.attempt,
            waiters: self.waiters,
            queued_for,
            running_for,
            error,
        }
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, JobRecord>,
    /// Fingerprint → the Queued or Running record building it.
    active: HashMap<Fingerprint, JobId>,
    queue: VecDeque<JobId>,
    running: usize,
    next_seq: u64,
}

impl JobTable {
    fn next_id(&mut self, fingerprint: &Fingerprint) -> JobId {
        self.next_seq += 1;
        JobId::new(fingerprint, self.next_seq)
    }

    /// The newest record of `id`'s lineage.
    fn head<'a>(&'a self, id: &'a JobId) -> Option<&'a JobId> {
        let mut current = id;
        let mut record = self.jobs.get(current)?;
        while let Some(next) = &record.retried_as {
            match self.jobs.get(next) {
                Some(r) => {
                    current = next;
                    record = r;
                }
                None => break,
            }
        }
        Some(current)
    }

    fn head_record(&self, id: &JobId) -> Option<&JobRecord> {
        self.head(id).and_then(|h| self.jobs.get(h))
    }

    /// Retire `id` from the active map if it is the fingerprint's builder.
    fn release_active(&mut self, fingerprint: &Fingerprint, id: &JobId) {
        if self.active.get(fingerprint) == Some(id) {
            self.active.remove(fingerprint);
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────────────

pub(crate) struct Shared {
    config: SchedulerConfig,
    renderer: Arc<dyn Renderer>,
    store: ArtifactStore,
    cache: ResultCache,
    table: Mutex<JobTable>,
    /// Wakes idle workers when a job is queued or on shutdown.
    work: Notify,
    shutting_down: AtomicBool,
    observer: Observer,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn subscribe(&self, id: &JobId) -> Option<watch::Receiver<JobState>> {
        self.table().jobs.get(id).map(|r| r.signal.subscribe())
    }

    fn successor_of(&self, id: &JobId) -> Option<JobId> {
        self.table().jobs.get(id).and_then(|r| r.retried_as.clone())
    }

    fn purge_expired(&self) -> PurgeReport {
        let cache_entries = self.cache.evict_expired();

        let retention = self.config.job_retention;
        let now = Instant::now();
        let expired: Vec<JobRecord> = {
            let mut table = self.table();
            let settled = |table: &JobTable, id: &JobId| {
                table.head_record(id).is_some_and(|head| {
                    head.state.is_terminal()
                        && head
                            .finished_at
                            .is_some_and(|t| now.saturating_duration_since(t) >= retention)
                })
            };
            let view: &JobTable = &table;
            let ids: Vec<JobId> = view
                .jobs
                .keys()
                .filter(|id| settled(view, id))
                .cloned()
                .collect();
            ids.iter().filter_map(|id| table.jobs.remove(id)).collect()
        };
        let job_records = expired.len();
        // Releases the retained pins outside the lock.
        drop(expired);

        let artifacts = self.store.sweep();
        let report = PurgeReport {
            cache_entries,
            job_records,
            artifacts,
        };
        if report != PurgeReport::default() {
            info!(
                "Purged {} cache entries, {} job records, {} artifacts",
                cache_entries, job_records, artifacts
            );
        }
        report
    }
}

// ── Public API ───────────────────────────────────────────────────────────

/// Accepts build requests and runs them on a bounded worker pool.
///
/// # Example
///
/// ```rust,no_run
/// use pressroom::{ArtifactStore, BuildRequest, CommandRenderer, JobScheduler, SchedulerConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = JobScheduler::start(
///     SchedulerConfig::default(),
///     Arc::new(CommandRenderer::new("templates")),
///     ArtifactStore::in_memory(),
/// )?;
///
/// let handle = scheduler.submit(BuildRequest::convert("# Hello", "classic"))?;
/// let artifact = scheduler.await_result(&handle, Duration::from_secs(300)).await?;
/// let pdf = scheduler.store().retrieve(&artifact.reference)?;
/// # Ok(())
/// # }
/// ```
pub struct JobScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    janitor: JoinHandle<()>,
}

impl JobScheduler {
    /// Spawn the worker pool and the janitor on the current Tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        renderer: Arc<dyn Renderer>,
        store: ArtifactStore,
    ) -> Result<Self, BuildError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            BuildError::internal("JobScheduler::start must be called inside a Tokio runtime")
        })?;

        let observer = config
            .observer
            .clone()
            .unwrap_or_else(|| Arc::new(NoopObserver) as Observer);
        let shared = Arc::new(Shared {
            cache: ResultCache::from_config(&config),
            renderer,
            store,
            table: Mutex::new(JobTable::default()),
            work: Notify::new(),
            shutting_down: AtomicBool::new(false),
            observer,
            config,
        });

        let workers = (0..shared.config.max_concurrent_renders)
            .map(|n| runtime.spawn(worker::run(Arc::clone(&shared), n)))
            .collect();
        let janitor = runtime.spawn(janitor(Arc::downgrade(&shared), shared.config.sweep_interval));

        info!(
            "Scheduler started: {} workers, queue limit {}, renderer '{}'",
            shared.config.max_concurrent_renders,
            shared.config.max_queue_length,
            shared.renderer.name()
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            janitor,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.shared.store
    }

    pub fn cache(&self) -> &ResultCache {
        &self.shared.cache
    }

    /// Admit a build request. Never blocks on rendering.
    ///
    /// Returns a cached handle when a fresh result exists, the in-flight
    /// job's handle when an identical build is queued or running, and a new
    /// job's handle otherwise.
    pub fn submit(&self, request: BuildRequest) -> Result<Handle, BuildError> {
        request.validate()?;
        if self.shared.is_shutting_down() {
            return Err(BuildError::internal("scheduler is shutting down"));
        }

        let fingerprint = Fingerprint::of_request(&request);
        if let Some(pin) = self.shared.cache.get(&fingerprint) {
            return Ok(self.cache_hit(&fingerprint, &pin));
        }

        enum Admission {
            Cached(ArtifactPin),
            Joined(JobId, usize),
            Queued(JobId, usize),
        }

        let admission = {
            let mut table = self.shared.table();
            // `shutdown` drains the queue under this lock after raising the flag.
            if self.shared.is_shutting_down() {
                return Err(BuildError::internal("scheduler is shutting down"));
            }
            // A build may have completed since the lookup above.
            if let Some(pin) = self.shared.cache.get(&fingerprint) {
                Admission::Cached(pin)
            } else if let Some(id) = table.active.get(&fingerprint).cloned() {
                let waiters = match table.jobs.get_mut(&id) {
                    Some(record) => {
                        record.waiters += 1;
                        record.waiters
                    }
                    None => return Err(BuildError::internal(format!("active job {id} has no record"))),
                };
                Admission::Joined(id, waiters)
            } else if table.queue.len() >= self.shared.config.max_queue_length {
                return Err(BuildError::QueueSaturated {
                    capacity: self.shared.config.max_queue_length,
                });
            } else {
                let id = table.next_id(&fingerprint);
                let record = JobRecord::new(id.clone(), fingerprint, Arc::new(request), 0, 1);
                table.jobs.insert(id.clone(), record);
                table.active.insert(fingerprint, id.clone());
                table.queue.push_back(id.clone());
                Admission::Queued(id, table.queue.len())
            }
        };

        match admission {
            Admission::Cached(pin) => Ok(self.cache_hit(&fingerprint, &pin)),
            Admission::Joined(id, waiters) => {
                debug!("Job {}: joined by another caller ({} waiting)", id, waiters);
                self.shared.observer.on_joined(&id, waiters);
                Ok(Handle::Job(id))
            }
            Admission::Queued(id, queue_len) => {
                info!("Job {}: queued ({} waiting)", id, queue_len);
                self.shared.observer.on_queued(&id, queue_len);
                self.shared.work.notify_one();
                Ok(Handle::Job(id))
            }
        }
    }

    fn cache_hit(&self, fingerprint: &Fingerprint, pin: &ArtifactPin) -> Handle {
        let reference = pin.reference();
        debug!("Cache hit for {} → {}", fingerprint.short(), reference.short());
        self.shared.observer.on_cache_hit(fingerprint, &reference);
        Handle::Cached(reference)
    }

    /// Current state of a handle's lineage. Never blocks, never fails.
    pub fn status(&self, handle: &Handle) -> JobState {
        match handle {
            Handle::Cached(reference) => {
                if self.shared.store.contains(reference) {
                    JobState::Succeeded
                } else {
                    JobState::Unknown
                }
            }
            Handle::Job(id) => self
                .shared
                .table()
                .head_record(id)
                .map_or(JobState::Unknown, |r| r.state),
        }
    }

    /// Detailed view of a handle's lineage head. `None` for cached or
    /// unknown handles.
    pub fn snapshot(&self, handle: &Handle) -> Option<JobSnapshot> {
        let id = handle.job_id()?;
        self.shared.table().head_record(id).map(JobRecord::snapshot)
    }

    /// Wait until the build behind `handle` finishes, for at most `timeout`.
    ///
    /// A timeout only abandons this wait; the build keeps running and a
    /// later call can still collect it.
    pub async fn await_result(&self, handle: &Handle, timeout: Duration) -> Result<Artifact, BuildError> {
        let mut current = match handle {
            Handle::Cached(reference) => return self.cached_artifact(reference),
            Handle::Job(id) => id.clone(),
        };
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut rx = self
                .shared
                .subscribe(&current)
                .ok_or_else(|| BuildError::not_found(format!("job {current}")))?;

            let waited = tokio::time::timeout_at(deadline, async {
                rx.wait_for(|s| s.is_terminal()).await.map(|_| ())
            })
            .await;
            match waited {
                Err(_) => {
                    return Err(BuildError::Timeout {
                        waited_ms: timeout.as_millis() as u64,
                    })
                }
                // The sender lives in the record; closed means purged.
                Ok(Err(_)) => return Err(BuildError::not_found(format!("job {current}"))),
                Ok(Ok(())) => {}
            }

            let next = {
                let table = self.shared.table();
                let record = table
                    .jobs
                    .get(&current)
                    .ok_or_else(|| BuildError::not_found(format!("job {current}")))?;
                match &record.retried_as {
                    Some(next) => next.clone(),
                    None => {
                        return record.result().unwrap_or_else(|| {
                            Err(BuildError::internal(format!("job {current} finished without outcome")))
                        })
                    }
                }
            };
            current = next;
        }
    }

    fn cached_artifact(&self, reference: &ArtifactRef) -> Result<Artifact, BuildError> {
        self.shared
            .store
            .metadata(reference)
            .ok_or_else(|| BuildError::not_found(format!("artifact {reference}")))
    }

    /// Request cancellation. Returns whether it was applied.
    ///
    /// Queued jobs are always canceled and never reach the renderer. A
    /// running job is only signalled when the renderer honours cancellation;
    /// otherwise it runs to its normal outcome, retries included.
    pub fn cancel(&self, handle: &Handle) -> bool {
        let Handle::Job(id) = handle else {
            return false;
        };

        let canceled = {
            let mut table = self.shared.table();
            let Some(head) = table.head(id).cloned() else {
                return false;
            };
            let Some(record) = table.jobs.get_mut(&head) else {
                return false;
            };
            match record.state {
                JobState::Queued => {
                    record.cancel_requested = true;
                    record.outcome = Some(Err(BuildError::Canceled));
                    record.transition(JobState::Canceled);
                    let fingerprint = record.fingerprint;
                    table.queue.retain(|q| q != &head);
                    table.release_active(&fingerprint, &head);
                    Some(head)
                }
                JobState::Running => {
                    // A renderer that ignores the flag runs the job to its normal end.
                    let applied = self.shared.renderer.supports_cancellation();
                    if applied {
                        record.cancel_requested = true;
                        record.cancel.cancel();
                    }
                    info!("Job {}: cancel requested while running (applied: {})", head, applied);
                    return applied;
                }
                _ => return false,
            }
        };

        if let Some(id) = canceled {
            info!("Job {}: canceled before start", id);
            self.shared.observer.on_finished(&id, Err(&BuildError::Canceled));
        }
        true
    }

    /// Stream of states for a handle's lineage, ending after a terminal one.
    ///
    /// The current state is yielded first. Intermediate `Failed` states of
    /// retried attempts are skipped.
    pub fn watch(&self, handle: &Handle) -> StateStream {
        let id = match handle {
            Handle::Job(id) => id.clone(),
            Handle::Cached(_) => return Box::pin(stream::iter([self.status(handle)])),
        };

        struct Cursor {
            shared: Arc<Shared>,
            current: Option<JobId>,
            rx: Option<watch::Receiver<JobState>>,
            last: Option<JobState>,
        }

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            current: Some(id),
            rx: None,
            last: None,
        };

        stream::unfold(cursor, |mut c| async move {
            loop {
                let id = c.current.clone()?;
                if c.rx.is_none() {
                    match c.shared.subscribe(&id) {
                        Some(rx) => c.rx = Some(rx),
                        None => {
                            c.current = None;
                            return c.last.is_none().then_some((JobState::Unknown, c));
                        }
                    }
                }
                let rx = c.rx.as_mut()?;
                let state = *rx.borrow_and_update();

                if state == JobState::Failed {
                    if let Some(next) = c.shared.successor_of(&id) {
                        c.current = Some(next);
                        c.rx = None;
                        continue;
                    }
                }
                if c.last != Some(state) {
                    c.last = Some(state);
                    if state.is_terminal() {
                        c.current = None;
                    }
                    return Some((state, c));
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }

    /// Drop stale cache entries, old finished job records and unpinned
    /// artifacts. Also run every `sweep_interval` in the background.
    pub fn purge_expired(&self) -> PurgeReport {
        self.shared.purge_expired()
    }

    pub fn stats(&self) -> SchedulerStats {
        let (queued, running, jobs) = {
            let table = self.shared.table();
            (table.queue.len(), table.running, table.jobs.len())
        };
        SchedulerStats {
            queued,
            running,
            jobs,
            cache_entries: self.shared.cache.len(),
            cache_bytes: self.shared.cache.total_bytes(),
            artifacts: self.shared.store.len(),
        }
    }

    /// Cancel everything still queued, let running builds finish, then stop
    /// the workers.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already requested");
        }

        let canceled: Vec<JobId> = {
            let mut table = self.shared.table();
            let queued: Vec<JobId> = table.queue.drain(..).collect();
            for id in &queued {
                if let Some(record) = table.jobs.get_mut(id) {
                    record.cancel_requested = true;
                    record.outcome = Some(Err(BuildError::Canceled));
                    record.transition(JobState::Canceled);
                    let fingerprint = record.fingerprint;
                    table.release_active(&fingerprint, id);
                }
            }
            queued
        };
        for id in &canceled {
            self.shared.observer.on_finished(id, Err(&BuildError::Canceled));
        }

        self.shared.work.notify_waiters();
        self.janitor.abort();

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped ({} queued jobs canceled)", canceled.len());
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        // Workers exit once the queue drains.
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.work.notify_waiters();
        self.janitor.abort();
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("renderer", &self.shared.renderer.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Periodic purge. Holds only a weak reference so it never keeps a dropped
/// scheduler alive.
async fn janitor(shared: Weak<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.purge_expired();
    }
}
