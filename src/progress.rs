//! Observer trait for job lifecycle events.
//!
//! Inject an [`Arc<dyn SchedulerObserver>`] via
//! [`crate::config::SchedulerConfigBuilder::observer`] to receive events as
//! the scheduler admits, runs and finishes builds.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a progress bar, a metrics registry or a
//! broadcast channel without the scheduler knowing how the host application
//! communicates. Callbacks fire from worker tasks and from `submit` callers
//! concurrently, so the trait is `Send + Sync`.
//!
//! # Example
//!
//! ```rust
//! use pressroom::{JobId, SchedulerConfig, SchedulerObserver};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingObserver {
//!     started: AtomicUsize,
//! }
//!
//! impl SchedulerObserver for CountingObserver {
//!     fn on_started(&self, job: &JobId, attempt: u32) {
//!         let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{job} attempt {attempt} started ({n} renders so far)");
//!     }
//! }
//!
//! let observer = Arc::new(CountingObserver { started: AtomicUsize::new(0) });
//!
//! let config = SchedulerConfig::builder()
//!     .observer(observer as Arc<dyn SchedulerObserver>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::BuildError;
use crate::fingerprint::Fingerprint;
use crate::job::JobId;
use crate::store::{Artifact, ArtifactRef};
use std::sync::Arc;

/// Called by the scheduler as builds move through their lifecycle.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_cache_hit`, `on_joined` and `on_queued` run on the submitting thread
/// while the admission lock is **not** held; the other events run on worker
/// tasks. Several events may be delivered at once from different threads.
pub trait SchedulerObserver: Send + Sync {
    /// A submission was answered from the result cache.
    fn on_cache_hit(&self, fingerprint: &Fingerprint, artifact: &ArtifactRef) {
        let _ = (fingerprint, artifact);
    }

    /// A submission joined an in-flight build.
    ///
    /// # Arguments
    /// * `job`     — the build that was joined
    /// * `waiters` — callers now attached, including the new one
    fn on_joined(&self, job: &JobId, waiters: usize) {
        let _ = (job, waiters);
    }

    /// A new build was queued.
    ///
    /// # Arguments
    /// * `job`       — the queued build
    /// * `queue_len` — jobs waiting, including this one
    fn on_queued(&self, job: &JobId, queue_len: usize) {
        let _ = (job, queue_len);
    }

    /// A worker picked a build and is about to call the renderer.
    fn on_started(&self, job: &JobId, attempt: u32) {
        let _ = (job, attempt);
    }

    /// An attempt failed transiently and a successor was scheduled.
    ///
    /// # Arguments
    /// * `job`       — the failed attempt
    /// * `successor` — the record that will run next
    /// * `error`     — human-readable failure of the attempt
    fn on_retry(&self, job: &JobId, successor: &JobId, error: &str) {
        let _ = (job, successor, error);
    }

    /// A build reached a terminal state.
    fn on_finished(&self, job: &JobId, outcome: Result<&Artifact, &BuildError>) {
        let _ = (job, outcome);
    }
}

/// A no-op implementation for callers that don't need lifecycle events.
///
/// This is the default when no observer is configured.
pub struct NoopObserver;

impl SchedulerObserver for NoopObserver {}

/// Convenience alias matching the type stored in [`crate::config::SchedulerConfig`].
pub type Observer = Arc<dyn SchedulerObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingObserver {
        queued: AtomicUsize,
        started: AtomicUsize,
        succeeded: AtomicUsize,
        failed: AtomicUsize,
        last_queue_len: AtomicUsize,
    }

    impl SchedulerObserver for TrackingObserver {
        fn on_queued(&self, _job: &JobId, queue_len: usize) {
            self.queued.fetch_add(1, Ordering::SeqCst);
            self.last_queue_len.store(queue_len, Ordering::SeqCst);
        }

        fn on_started(&self, _job: &JobId, _attempt: u32) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn on_finished(&self, _job: &JobId, outcome: Result<&Artifact, &BuildError>) {
            match outcome {
                Ok(_) => self.succeeded.fetch_add(1, Ordering::SeqCst),
                Err(_) => self.failed.fetch_add(1, Ordering::SeqCst),
            };
        }
    }

    fn job(seq: u64) -> JobId {
        JobId::new(&Fingerprint::of_bytes(b"progress"), seq)
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let obs = NoopObserver;
        let fp = Fingerprint::of_bytes(b"x");
        obs.on_cache_hit(&fp, &ArtifactRef::of_bytes(b"%PDF"));
        obs.on_joined(&job(1), 2);
        obs.on_queued(&job(1), 1);
        obs.on_started(&job(1), 0);
        obs.on_retry(&job(1), &job(2), "TeX capacity exceeded");
        obs.on_finished(&job(2), Err(&BuildError::Canceled));
    }

    #[test]
    fn tracking_observer_receives_events() {
        let tracker = TrackingObserver::default();

        tracker.on_queued(&job(1), 1);
        tracker.on_queued(&job(2), 2);
        assert_eq!(tracker.last_queue_len.load(Ordering::SeqCst), 2);

        tracker.on_started(&job(1), 0);
        tracker.on_started(&job(2), 0);
        tracker.on_finished(
            &job(2),
            Err(&BuildError::Permanent {
                message: "Undefined control sequence".into(),
            }),
        );

        assert_eq!(tracker.queued.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.started.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.failed.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.succeeded.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn arc_dyn_observer_works() {
        let obs: Observer = Arc::new(NoopObserver);
        obs.on_queued(&job(7), 1);
        obs.on_started(&job(7), 0);
    }
}
