//! Error types for the pressroom library.
//!
//! Two distinct error types reflect two distinct audiences:
//!
//! * [`BuildError`] — **Caller-facing**: the typed outcome every `submit`,
//!   `await_result`, `fetch` or store call can return. It is `Clone` because
//!   one failed build fans its terminal error out to every waiter, including
//!   callers that join after the failure.
//!
//! * [`RenderError`] — **Renderer-facing**: what a [`crate::renderer::Renderer`]
//!   reports for one attempt. The renderer classifies; the scheduler decides
//!   whether to retry and converts the final attempt into a `BuildError`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every error a caller of the build core can observe.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildError {
    // ── Admission ─────────────────────────────────────────────────────────
    /// The request failed validation; no job was created.
    #[error("Invalid build request: {reason}")]
    InvalidRequest { reason: String },

    /// The queue already holds `capacity` jobs.
    #[error("Build queue is full ({capacity} jobs waiting)\nRetry the submission later.")]
    QueueSaturated { capacity: usize },

    // ── Rendering ─────────────────────────────────────────────────────────
    /// The renderer kept failing with retryable errors until retries ran out.
    #[error("Render failed after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },

    /// The renderer reported an error that retrying cannot fix.
    #[error("Render failed: {message}")]
    Permanent { message: String },

    /// The build was canceled before it produced an artifact.
    #[error("Build was canceled")]
    Canceled,

    // ── Waiting & lookup ──────────────────────────────────────────────────
    /// The caller's wait expired; the build itself keeps running.
    #[error("Gave up waiting after {waited_ms}ms\nThe build is still running; fetch it again later.")]
    Timeout { waited_ms: u64 },

    /// Unknown handle, fingerprint or artifact.
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// An artifact cannot be deleted while something still references it.
    #[error("Artifact {reference} is still referenced ({pins} pin(s))")]
    InUse { reference: String, pins: usize },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Scratch directory, artifact storage or task failures.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BuildError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        BuildError::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        BuildError::NotFound { what: what.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        BuildError::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable code, used as the `kind` of API errors.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            BuildError::InvalidRequest { .. } => "invalid_request",
            BuildError::QueueSaturated { .. } => "queue_saturated",
            BuildError::Transient { .. } => "transient",
            BuildError::Permanent { .. } => "permanent",
            BuildError::Canceled => "canceled",
            BuildError::Timeout { .. } => "timeout",
            BuildError::NotFound { .. } => "not_found",
            BuildError::InUse { .. } => "in_use",
            BuildError::Internal { .. } => "internal",
        }
    }

    /// Whether submitting the same request again later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BuildError::QueueSaturated { .. }
                | BuildError::Transient { .. }
                | BuildError::Timeout { .. }
                | BuildError::Internal { .. }
        )
    }
}

/// The outcome class of one failed render attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// Resource exhaustion, timeouts, flaky tools: worth another attempt.
    #[error("{0}")]
    Transient(String),

    /// Malformed templates, LaTeX errors, missing binaries.
    #[error("{0}")]
    Permanent(String),

    /// The attempt stopped because its cancel flag was raised.
    #[error("render canceled")]
    Canceled,
}

impl RenderError {
    pub fn transient(message: impl Into<String>) -> Self {
        RenderError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        RenderError::Permanent(message.into())
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RenderError::Transient(_))
    }

    /// Terminal caller-facing error after `attempts` render attempts.
    pub fn into_build_error(self, attempts: u32) -> BuildError {
        match self {
            RenderError::Transient(message) => BuildError::Transient { attempts, message },
            RenderError::Permanent(message) => BuildError::Permanent { message },
            RenderError::Canceled => BuildError::Canceled,
        }
    }
}
