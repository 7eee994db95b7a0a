//! Worker tasks: pull queued jobs, run attempts, publish outcomes.
//!
//! ## Why spawn_blocking?
//!
//! Renderers block for seconds to minutes (child processes, file I/O). Each
//! attempt runs on Tokio's blocking pool so worker tasks stay cheap and the
//! async runtime keeps serving `submit`, `status` and `await_result`.

use super::{Finished, JobRecord, Shared};
use crate::error::{BuildError, RenderError};
use crate::fingerprint::Fingerprint;
use crate::job::{CancelFlag, JobId, JobState};
use crate::renderer::{verify_pdf, RenderContext};
use crate::request::BuildRequest;
use crate::store::ArtifactPin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a timed-out attempt may take to notice its cancel flag.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// What a worker needs to run one attempt.
pub(super) struct Dispatch {
    id: JobId,
    fingerprint: Fingerprint,
    request: Arc<BuildRequest>,
    cancel: CancelFlag,
    attempt: u32,
}

impl Dispatch {
    fn of(record: &JobRecord) -> Self {
        Self {
            id: record.id.clone(),
            fingerprint: record.fingerprint,
            request: Arc::clone(&record.request),
            cancel: record.cancel.clone(),
            attempt: record.attempt,
        }
    }
}

#[derive(Debug)]
enum Failure {
    Render(RenderError),
    /// Scratch directory, artifact store or task failures.
    Internal(String),
}

/// Worker loop. Exits once shutdown is requested and the queue is empty.
pub(super) async fn run(shared: Arc<Shared>, index: usize) {
    debug!("Worker {} started", index);
    loop {
        let job = {
            let notified = shared.work.notified();
            tokio::pin!(notified);
            // Register before looking at the queue so no wake-up is lost.
            notified.as_mut().enable();

            match shared.next_job() {
                Some(job) => job,
                None if shared.is_shutting_down() => break,
                None => {
                    notified.await;
                    continue;
                }
            }
        };
        shared.execute(job).await;
    }
    debug!("Worker {} stopped", index);
}

impl Shared {
    /// Pop the oldest queued job and mark it running.
    fn next_job(&self) -> Option<Dispatch> {
        let mut table = self.table();
        while let Some(id) = table.queue.pop_front() {
            let Some(record) = table.jobs.get_mut(&id) else {
                continue;
            };
            if record.state != JobState::Queued {
                continue;
            }
            record.transition(JobState::Running);
            let job = Dispatch::of(record);
            table.running += 1;
            return Some(job);
        }
        None
    }

    /// Run a job and its retries to a terminal outcome.
    async fn execute(self: &Arc<Self>, mut job: Dispatch) {
        loop {
            self.observer.on_started(&job.id, job.attempt);
            info!("Job {}: attempt {} started", job.id, job.attempt + 1);
            let started = Instant::now();

            let outcome = self.run_attempt(&job).await;
            debug!(
                "Job {}: attempt {} returned after {:.1}s",
                job.id,
                job.attempt + 1,
                started.elapsed().as_secs_f64()
            );

            match outcome {
                Ok(pin) => return self.succeed(&job, pin),
                Err(Failure::Render(e)) if e.is_transient() && job.attempt < self.config.max_retries => {
                    let Some(next) = self.schedule_retry(&job, &e) else {
                        return;
                    };
                    let delay = self.config.backoff_for(job.attempt + 1);
                    warn!(
                        "Job {}: attempt {} failed ({}); retrying as {} in {:?}",
                        job.id,
                        job.attempt + 1,
                        e,
                        next,
                        delay
                    );
                    self.observer.on_retry(&job.id, &next, &e.to_string());
                    tokio::time::sleep(delay).await;

                    match self.resume(&next) {
                        Some(successor) => job = successor,
                        None => return,
                    }
                }
                Err(Failure::Render(e)) => {
                    let error = e.into_build_error(job.attempt + 1);
                    return self.fail(&job, error);
                }
                Err(Failure::Internal(message)) => {
                    return self.fail(&job, BuildError::internal(message));
                }
            }
        }
    }

    /// One render attempt in a fresh scratch directory.
    async fn run_attempt(&self, job: &Dispatch) -> Result<ArtifactPin, Failure> {
        let renderer = Arc::clone(&self.renderer);
        let store = self.store.clone();
        let request = Arc::clone(&job.request);
        let id = job.id.clone();
        let cancel = job.cancel.clone();
        let attempt = job.attempt;
        let limit = self.config.render_timeout;
        let deadline = limit.map(|d| Instant::now() + d);
        let scratch_root = self
            .config
            .scratch_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        let mut task = tokio::task::spawn_blocking(move || -> Result<ArtifactPin, Failure> {
            std::fs::create_dir_all(&scratch_root).map_err(|e| {
                Failure::Internal(format!("cannot create {}: {e}", scratch_root.display()))
            })?;
            let scratch = tempfile::Builder::new()
                .prefix(&format!("pressroom-{id}-"))
                .tempdir_in(&scratch_root)
                .map_err(|e| Failure::Internal(format!("cannot create scratch directory: {e}")))?;

            let ctx = RenderContext {
                job_id: &id,
                attempt,
                work_dir: scratch.path(),
                cancel: &cancel,
                deadline,
            };
            let rendered = renderer
                .render(&request, &ctx)
                .and_then(|bytes| verify_pdf(&bytes).map(|()| bytes));

            // The directory goes away before the worker moves on.
            let dir = scratch.path().to_path_buf();
            if let Err(e) = scratch.close() {
                warn!("Job {}: cannot remove scratch dir {}: {}", id, dir.display(), e);
            }

            let bytes = rendered.map_err(Failure::Render)?;
            store
                .store(bytes, Some(id.clone()))
                .map_err(|e| Failure::Internal(e.to_string()))
        });

        let mut timed_out = false;
        let joined = match limit {
            None => task.await,
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        "Job {}: no result after {:?}; signalling the renderer to stop",
                        job.id, limit
                    );
                    timed_out = true;
                    job.cancel.cancel();
                    match tokio::time::timeout(CANCEL_GRACE, &mut task).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            warn!(
                                "Job {}: renderer '{}' ignores cancellation; worker blocked until it returns",
                                job.id,
                                self.renderer.name()
                            );
                            task.await
                        }
                    }
                }
            },
        };

        let result = joined.map_err(|e| Failure::Internal(format!("render task failed: {e}")))?;
        match (result, limit) {
            (Err(Failure::Render(_)), Some(limit)) if timed_out && !self.cancel_requested(&job.id) => {
                Err(Failure::Render(RenderError::transient(format!(
                    "render timed out after {:.1}s",
                    limit.as_secs_f64()
                ))))
            }
            (result, _) => result,
        }
    }

    fn cancel_requested(&self, id: &JobId) -> bool {
        self.table().jobs.get(id).is_some_and(|r| r.cancel_requested)
    }

    fn succeed(&self, job: &Dispatch, pin: ArtifactPin) {
        let Some(artifact) = pin.artifact() else {
            return self.fail(job, BuildError::internal("stored artifact vanished"));
        };

        // Publish before retiring the fingerprint; see the module docs.
        self.cache.put(job.fingerprint, pin.clone());
        {
            let mut table = self.table();
            table.running = table.running.saturating_sub(1);
            table.release_active(&job.fingerprint, &job.id);
            if let Some(record) = table.jobs.get_mut(&job.id) {
                record.outcome = Some(Ok(Finished {
                    _pin: pin,
                    artifact: artifact.clone(),
                }));
                record.transition(JobState::Succeeded);
            }
        }

        info!(
            "Job {}: succeeded ({} bytes, artifact {})",
            job.id,
            artifact.size_bytes,
            artifact.reference.short()
        );
        self.observer.on_finished(&job.id, Ok(&artifact));
    }

    fn fail(&self, job: &Dispatch, error: BuildError) {
        let state = if error == BuildError::Canceled {
            JobState::Canceled
        } else {
            JobState::Failed
        };
        {
            let mut table = self.table();
            table.running = table.running.saturating_sub(1);
            table.release_active(&job.fingerprint, &job.id);
            if let Some(record) = table.jobs.get_mut(&job.id) {
                record.outcome = Some(Err(error.clone()));
                record.transition(state);
            }
        }

        match state {
            JobState::Canceled => info!("Job {}: canceled while running", job.id),
            _ => warn!("Job {}: failed: {}", job.id, error),
        }
        self.observer.on_finished(&job.id, Err(&error));
    }

    /// Retire the failed attempt and create its Queued successor.
    ///
    /// Returns `None` (after failing the job) when the job was canceled or
    /// the scheduler is shutting down.
    fn schedule_retry(&self, job: &Dispatch, error: &RenderError) -> Option<JobId> {
        let mut table = self.table();
        let (waiters, cancel_requested) = table
            .jobs
            .get(&job.id)
            .map(|r| (r.waiters, r.cancel_requested))?;

        if cancel_requested || self.is_shutting_down() {
            drop(table);
            self.fail(job, BuildError::Canceled);
            return None;
        }

        let next = table.next_id(&job.fingerprint);
        let successor = JobRecord::new(
            next.clone(),
            job.fingerprint,
            Arc::clone(&job.request),
            job.attempt + 1,
            waiters,
        );
        table.jobs.insert(next.clone(), successor);
        table.active.insert(job.fingerprint, next.clone());
        table.running = table.running.saturating_sub(1);

        if let Some(record) = table.jobs.get_mut(&job.id) {
            record.retried_as = Some(next.clone());
            record.outcome = Some(Err(error.clone().into_build_error(job.attempt + 1)));
            record.transition(JobState::Failed);
        }
        Some(next)
    }

    /// Start the successor after its backoff, unless it was canceled.
    fn resume(&self, next: &JobId) -> Option<Dispatch> {
        let canceled_by_shutdown = {
            let mut table = self.table();
            let shutting_down = self.is_shutting_down();
            let record = table.jobs.get_mut(next)?;
            if record.state != JobState::Queued {
                debug!("Job {}: canceled during backoff", next);
                return None;
            }
            if shutting_down {
                record.cancel_requested = true;
                record.outcome = Some(Err(BuildError::Canceled));
                record.transition(JobState::Canceled);
                let fingerprint = record.fingerprint;
                table.release_active(&fingerprint, next);
                true
            } else {
                record.transition(JobState::Running);
                let job = Dispatch::of(record);
                table.running += 1;
                return Some(job);
            }
        };

        if canceled_by_shutdown {
            info!("Job {}: canceled by shutdown during backoff", next);
            self.observer.on_finished(next, Err(&BuildError::Canceled));
        }
        None
    }
}
