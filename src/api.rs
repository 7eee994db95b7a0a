//! Boundary facade: JSON-shaped requests and responses over the scheduler.
//!
//! Handles cross this boundary as strings (`job:<id>` or `cached:<sha256>`)
//! and byte payloads as base64. Every failure becomes an [`ApiError`] with
//! an HTTP-style status so a transport layer can forward it unchanged.

use crate::error::BuildError;
use crate::fingerprint::Fingerprint;
use crate::job::{Handle, JobState};
use crate::request::{BuildKind, BuildRequest, TemplateSelection};
use crate::scheduler::JobScheduler;
use crate::store::ArtifactRef;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ── DTOs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub kind: BuildKind,
    #[serde(with = "base64_bytes")]
    pub source_content: Vec<u8>,
    #[serde(default)]
    pub template: TemplateSelection,
    #[serde(default)]
    pub requester_id: Option<String>,
}

impl From<SubmitRequest> for BuildRequest {
    fn from(r: SubmitRequest) -> Self {
        BuildRequest {
            kind: r.kind,
            source_content: r.source_content,
            template: r.template,
            requester_id: r.requester_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitResponse {
    pub handle: Handle,
    pub fingerprint: Fingerprint,
    /// Answered from the cache without creating a job.
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusResponse {
    pub handle: Handle,
    pub state: JobState,
    /// 0-based attempt of the lineage head; absent for cached handles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiters: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchResponse {
    pub artifact: ArtifactRef,
    pub size_bytes: u64,
    #[serde(serialize_with = "base64_bytes::serialize")]
    pub bytes: Arc<[u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelResponse {
    pub applied: bool,
}

/// A failure as the boundary reports it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct ApiError {
    /// Machine-readable code, e.g. `queue_saturated`.
    pub kind: String,
    pub message: String,
    /// HTTP-style status code.
    pub status: u16,
}

impl ApiError {
    fn bad_handle(reason: String) -> Self {
        ApiError::from(BuildError::invalid(reason))
    }
}

impl From<BuildError> for ApiError {
    fn from(e: BuildError) -> Self {
        let status = match &e {
            BuildError::InvalidRequest { .. } => 400,
            BuildError::NotFound { .. } => 404,
            BuildError::InUse { .. } | BuildError::Canceled => 409,
            BuildError::Permanent { .. } => 422,
            BuildError::QueueSaturated { .. } | BuildError::Transient { .. } => 503,
            BuildError::Timeout { .. } => 504,
            BuildError::Internal { .. } => 500,
        };
        ApiError {
            kind: e.code().to_string(),
            message: e.to_string(),
            status,
        }
    }
}

// ── Facade ───────────────────────────────────────────────────────────────

/// Translates boundary calls into scheduler operations.
#[derive(Debug, Clone)]
pub struct BuildApi {
    scheduler: Arc<JobScheduler>,
}

impl BuildApi {
    pub fn new(scheduler: Arc<JobScheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ApiError> {
        let request = BuildRequest::from(request);
        let fingerprint = Fingerprint::of_request(&request);
        let handle = self.scheduler.submit(request)?;
        Ok(SubmitResponse {
            cached: handle.is_cached(),
            handle,
            fingerprint,
        })
    }

    pub fn status(&self, handle: &str) -> Result<StatusResponse, ApiError> {
        let handle: Handle = handle.parse().map_err(ApiError::bad_handle)?;
        let state = self.scheduler.status(&handle);
        let snapshot = self.scheduler.snapshot(&handle);
        Ok(StatusResponse {
            attempt: snapshot.as_ref().map(|s| s.attempt),
            waiters: snapshot.as_ref().map(|s| s.waiters),
            error: snapshot.and_then(|s| s.error),
            handle,
            state,
        })
    }

    /// Wait for the artifact and return its bytes.
    ///
    /// `timeout_ms` defaults to the scheduler's `fetch_timeout`.
    pub async fn fetch(&self, handle: &str, timeout_ms: Option<u64>) -> Result<FetchResponse, ApiError> {
        let handle: Handle = handle.parse().map_err(ApiError::bad_handle)?;
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.scheduler.config().fetch_timeout);

        let artifact = self.scheduler.await_result(&handle, timeout).await?;

        let store = self.scheduler.store().clone();
        let reference = artifact.reference;
        let bytes = tokio::task::spawn_blocking(move || store.retrieve(&reference))
            .await
            .map_err(|e| BuildError::internal(format!("artifact read task failed: {e}")))??;

        Ok(FetchResponse {
            artifact: artifact.reference,
            size_bytes: artifact.size_bytes,
            bytes,
        })
    }

    pub fn cancel(&self, handle: &str) -> Result<CancelResponse, ApiError> {
        let handle: Handle = handle.parse().map_err(ApiError::bad_handle)?;
        Ok(CancelResponse {
            applied: self.scheduler.cancel(&handle),
        })
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (BuildError::invalid("x"), 400),
            (BuildError::not_found("job:x"), 404),
            (BuildError::Canceled, 409),
            (
                BuildError::Permanent {
                    message: "bad".into(),
                },
                422,
            ),
            (BuildError::QueueSaturated { capacity: 1 }, 503),
            (BuildError::Timeout { waited_ms: 1 }, 504),
            (BuildError::internal("disk"), 500),
        ];
        for (error, status) in cases {
            let code = error.code();
            let api = ApiError::from(error);
            assert_eq!(api.status, status, "{code}");
            assert_eq!(api.kind, code);
        }
    }

    #[test]
    fn submit_request_decodes_base64_content() {
        let json = r#"{"kind":"convert","source_content":"IyBIZWxsbw==","template":{"layout":"classic"}}"#;
        let request: SubmitRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.source_content, b"# Hello");
        assert_eq!(request.template.layout, "classic");
        assert_eq!(request.requester_id, None);
    }

    #[test]
    fn fetch_response_encodes_bytes() {
        let bytes: Arc<[u8]> = Arc::from(&b"%PDF-1.7"[..]);
        let response = FetchResponse {
            artifact: ArtifactRef::of_bytes(&bytes),
            size_bytes: bytes.len() as u64,
            bytes,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["bytes"], "JVBERi0xLjc=");
        assert_eq!(json["size_bytes"], 8);
    }
}
