//! # pressroom
//!
//! Build orchestration for Markdown-to-print PDF pipelines.
//!
//! ## Why this crate?
//!
//! Turning a manuscript into print-ready PDFs means running Pandoc and a LaTeX
//! engine: seconds to minutes of CPU per build. Editors re-submit the same
//! manuscript over and over, several people preview the same cover, and a
//! burst of requests can easily exceed what one machine can render at once.
//! This crate sits in front of the toolchain and makes sure identical builds
//! render once, callers share the result, and the machine never runs more
//! renders than it has workers for.
//!
//! ## Architecture
//!
//! ```text
//! BuildRequest
//!  │
//!  ├─ 1. Validate     reject empty content / missing template
//!  ├─ 2. Fingerprint  SHA-256 over kind, content, template selection
//!  ├─ 3. Cache        fresh result?          → cached handle
//!  ├─ 4. Dedup        identical build active? → join it
//!  ├─ 5. Admit        queue full?             → QueueSaturated
//!  ├─ 6. Render       bounded workers, spawn_blocking, retries
//!  └─ 7. Publish      artifact store (content-addressed) + result cache
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pressroom::{ArtifactStore, BuildRequest, CommandRenderer, JobScheduler, SchedulerConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SchedulerConfig::builder().max_concurrent_renders(2).build()?;
//!     let scheduler = JobScheduler::start(
//!         config,
//!         Arc::new(CommandRenderer::new("templates")),
//!         ArtifactStore::open("out/artifacts")?,
//!     )?;
//!
//!     let handle = scheduler.submit(BuildRequest::convert("# Chapter One\n", "classic"))?;
//!     let artifact = scheduler.await_result(&handle, Duration::from_secs(300)).await?;
//!     let pdf = scheduler.store().retrieve(&artifact.reference)?;
//!     std::fs::write("book.pdf", &pdf)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pressroom` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when embedding the scheduler in a service:
//! ```toml
//! pressroom = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod input;
pub mod job;
pub mod progress;
pub mod renderer;
pub mod request;
pub mod scheduler;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use api::{ApiError, BuildApi, CancelResponse, FetchResponse, StatusResponse, SubmitRequest, SubmitResponse};
pub use cache::ResultCache;
pub use config::{ConfigError, SchedulerConfig, SchedulerConfigBuilder};
pub use error::{BuildError, RenderError};
pub use fingerprint::Fingerprint;
pub use input::{load_manuscript, InputError};
pub use job::{CancelFlag, Handle, JobId, JobSnapshot, JobState};
pub use progress::{NoopObserver, SchedulerObserver};
pub use renderer::{list_templates, CommandRenderer, RenderContext, Renderer, TemplateEntry};
pub use request::{BuildKind, BuildRequest, TemplateSelection};
pub use scheduler::{JobScheduler, PurgeReport, SchedulerStats, StateStream};
pub use store::{Artifact, ArtifactPin, ArtifactRef, ArtifactStore};
pub use template_descriptor::{parse_template_descriptor, TemplateDescriptor, TemplateKind};
