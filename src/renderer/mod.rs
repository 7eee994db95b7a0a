//! Renderer contract: the external toolchain as the scheduler sees it.
//!
//! ## Why a blocking trait?
//!
//! Real renders shell out to Pandoc and a LaTeX engine and take seconds to
//! minutes. The scheduler runs every call inside
//! `tokio::task::spawn_blocking`, so implementations are free to block,
//! spawn processes and touch the file system without stalling the Tokio
//! worker threads.
//!
//! ## Isolation
//!
//! Every attempt gets its own freshly created [`RenderContext::work_dir`],
//! removed after the attempt. Implementations may write anything there and
//! must not write anywhere else; that is what makes concurrent calls from
//! several workers safe.

pub mod command;
pub mod templates;

pub use command::{CommandRenderer, CommandRendererBuilder};
pub use templates::{list_templates, TemplateEntry};

use crate::error::RenderError;
use crate::job::{CancelFlag, JobId};
use crate::request::BuildRequest;
use std::path::Path;
use std::time::Instant;

/// Everything a renderer gets besides the request itself.
#[derive(Debug)]
pub struct RenderContext<'a> {
    pub job_id: &'a JobId,
    /// 0-based attempt number.
    pub attempt: u32,
    /// Empty scratch directory owned by this attempt.
    pub work_dir: &'a Path,
    /// Raised when the job is canceled or its hard timeout fires.
    pub cancel: &'a CancelFlag,
    /// When the scheduler stops waiting for this attempt.
    pub deadline: Option<Instant>,
}

impl RenderContext<'_> {
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    #[must_use]
    pub fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Converts a build request into PDF bytes.
///
/// Implementations classify failures: [`RenderError::Transient`] for
/// problems another attempt may not hit (resource exhaustion, timeouts),
/// [`RenderError::Permanent`] for everything else.
pub trait Renderer: Send + Sync {
    /// Produce the PDF for `request`. Blocking.
    fn render(&self, request: &BuildRequest, ctx: &RenderContext<'_>) -> Result<Vec<u8>, RenderError>;

    /// Whether [`RenderContext::cancel`] is honoured while `render` runs.
    fn supports_cancellation(&self) -> bool {
        false
    }

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// Check that renderer output is a PDF.
pub fn verify_pdf(bytes: &[u8]) -> Result<(), RenderError> {
    if bytes.starts_with(b"%PDF-") {
        Ok(())
    } else if bytes.is_empty() {
        Err(RenderError::permanent("renderer produced no output"))
    } else {
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(16)]).into_owned();
        Err(RenderError::permanent(format!(
            "renderer output is not a PDF (starts with {head:?})"
        )))
    }
}
