//! Configuration for the build scheduler and its cache.
//!
//! All scheduling behaviour is controlled through [`SchedulerConfig`], built
//! via its [`SchedulerConfigBuilder`]. The config is an explicit value passed
//! to [`crate::scheduler::JobScheduler::start`]; nothing is read from globals
//! at run time, so two schedulers in one process can be tuned independently.

use crate::progress::SchedulerObserver;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Invalid scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for a [`crate::scheduler::JobScheduler`].
///
/// Built via [`SchedulerConfig::builder()`] or using
/// [`SchedulerConfig::default()`].
///
/// # Example
/// ```rust
/// use pressroom::SchedulerConfig;
/// use std::time::Duration;
///
/// let config = SchedulerConfig::builder()
///     .max_concurrent_renders(2)
///     .max_queue_length(16)
///     .cache_ttl(Duration::from_secs(600))
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent_renders, 2);
/// ```
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Worker tasks, i.e. renders that may run at once. Default: CPU count.
    ///
    /// Each render is a LaTeX run that saturates one core; more workers than
    /// cores only adds contention.
    pub max_concurrent_renders: usize,

    /// Queued jobs allowed before `submit` fails with `QueueSaturated`. Default: 64.
    pub max_queue_length: usize,

    /// Hard ceiling on cache entry age and idle time. Default: 1 hour.
    pub cache_ttl: Duration,

    /// Maximum number of cached results. Default: 512.
    pub cache_max_entries: usize,

    /// Maximum total bytes of cached artifacts. Default: 1 GiB.
    pub cache_max_bytes: u64,

    /// Extra attempts after a `Transient` render failure. Default: 1.
    pub max_retries: u32,

    /// Base delay between attempts, doubled after each one. Default: 2 s.
    pub retry_backoff: Duration,

    /// Hard limit for one render attempt. Default: 300 s. `None` disables it.
    pub render_timeout: Option<Duration>,

    /// Default wait used by the API facade's `fetch`. Default: 300 000 ms.
    pub fetch_timeout: Duration,

    /// How long finished job records stay queryable. Default: 1 hour.
    pub job_retention: Duration,

    /// Period of the background purge of stale cache entries, job records
    /// and unpinned artifacts. Default: 60 s.
    pub sweep_interval: Duration,

    /// Parent directory for per-job scratch directories. Default: system temp dir.
    pub scratch_root: Option<PathBuf>,

    /// Lifecycle observer (progress bars, metrics). Default: none.
    pub observer: Option<Arc<dyn SchedulerObserver>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_renders: default_parallelism(),
            max_queue_length: 64,
            cache_ttl: Duration::from_secs(3600),
            cache_max_entries: 512,
            cache_max_bytes: 1024 * 1024 * 1024,
            max_retries: 1,
            retry_backoff: Duration::from_secs(2),
            render_timeout: Some(Duration::from_secs(300)),
            fetch_timeout: Duration::from_millis(300_000),
            job_retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            scratch_root: None,
            observer: None,
        }
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("max_concurrent_renders", &self.max_concurrent_renders)
            .field("max_queue_length", &self.max_queue_length)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_max_entries", &self.cache_max_entries)
            .field("cache_max_bytes", &self.cache_max_bytes)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("render_timeout", &self.render_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("job_retention", &self.job_retention)
            .field("sweep_interval", &self.sweep_interval)
            .field("scratch_root", &self.scratch_root)
            .field("observer", &self.observer.as_ref().map(|_| "<dyn SchedulerObserver>"))
            .finish()
    }
}

impl SchedulerConfig {
    /// Create a new builder for `SchedulerConfig`.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Backoff before attempt `attempt` (1-based retry number).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor)
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// Builder for [`SchedulerConfig`].
#[derive(Debug)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn max_concurrent_renders(mut self, n: usize) -> Self {
        self.config.max_concurrent_renders = n;
        self
    }

    pub fn max_queue_length(mut self, n: usize) -> Self {
        self.config.max_queue_length = n;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn cache_ttl_secs(self, secs: u64) -> Self {
        self.cache_ttl(Duration::from_secs(secs))
    }

    pub fn cache_max_entries(mut self, n: usize) -> Self {
        self.config.cache_max_entries = n;
        self
    }

    pub fn cache_max_bytes(mut self, bytes: u64) -> Self {
        self.config.cache_max_bytes = bytes;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff(mut self, base: Duration) -> Self {
        self.config.retry_backoff = base;
        self
    }

    pub fn render_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.render_timeout = timeout;
        self
    }

    pub fn render_timeout_secs(self, secs: u64) -> Self {
        self.render_timeout(Some(Duration::from_secs(secs)))
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    pub fn job_retention(mut self, retention: Duration) -> Self {
        self.config.job_retention = retention;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = Some(dir.into());
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<SchedulerConfig, ConfigError> {
        let c = &self.config;
        if c.max_concurrent_renders == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_renders must be ≥ 1".into(),
            ));
        }
        if c.max_queue_length == 0 {
            return Err(ConfigError::Invalid("max_queue_length must be ≥ 1".into()));
        }
        if c.cache_max_entries == 0 {
            return Err(ConfigError::Invalid("cache_max_entries must be ≥ 1".into()));
        }
        if c.cache_ttl.is_zero() {
            return Err(ConfigError::Invalid("cache_ttl must be non-zero".into()));
        }
        if c.render_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid(
                "render_timeout must be non-zero (use None to disable)".into(),
            ));
        }
        if c.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("sweep_interval must be non-zero".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = SchedulerConfig::default();
        assert!(c.max_concurrent_renders >= 1);
        assert_eq!(c.cache_ttl, Duration::from_secs(3600));
        assert_eq!(c.max_retries, 1);
        assert_eq!(c.retry_backoff, Duration::from_secs(2));
        assert_eq!(c.fetch_timeout, Duration::from_millis(300_000));
        assert_eq!(c.render_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn backoff_doubles() {
        let c = SchedulerConfig::default();
        assert_eq!(c.backoff_for(1), Duration::from_secs(2));
        assert_eq!(c.backoff_for(2), Duration::from_secs(4));
        assert_eq!(c.backoff_for(3), Duration::from_secs(8));
    }

    #[test]
    fn zero_workers_rejected() {
        let err = SchedulerConfig::builder()
            .max_concurrent_renders(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_renders"));
    }

    #[test]
    fn zero_render_timeout_rejected_but_none_allowed() {
        assert!(SchedulerConfig::builder()
            .render_timeout(Some(Duration::ZERO))
            .build()
            .is_err());
        let c = SchedulerConfig::builder().render_timeout(None).build().unwrap();
        assert!(c.render_timeout.is_none());
    }

    #[test]
    fn debug_hides_observer() {
        let c = SchedulerConfig::builder()
            .observer(Arc::new(crate::progress::NoopObserver))
            .build()
            .unwrap();
        assert!(format!("{c:?}").contains("<dyn SchedulerObserver>"));
    }
}
