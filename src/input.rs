//! Input resolution: load a manuscript given as a local path or a URL.
//!
//! ## Why bytes, not paths?
//!
//! A [`crate::BuildRequest`] carries its source content inline. The
//! fingerprint is computed over those bytes, so two submissions of the same
//! manuscript dedupe no matter where it was loaded from, and a file edited
//! after submission cannot change a build that is already queued.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Why a manuscript could not be loaded.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Download of {url} timed out after {secs}s")]
    DownloadTimeout { url: String, secs: u64 },

    #[error("Manuscript is empty: {origin}")]
    Empty { origin: String },
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load the manuscript named by `input`.
///
/// URLs are fetched with a `timeout` covering the whole request; anything
/// else is read as a local file.
pub async fn load_manuscript(input: &str, timeout: Duration) -> Result<Vec<u8>, InputError> {
    let bytes = if is_url(input) {
        download(input, timeout).await?
    } else {
        read_local(input).await?
    };
    if bytes.is_empty() {
        return Err(InputError::Empty {
            origin: input.to_string(),
        });
    }
    Ok(bytes)
}

async fn read_local(path_str: &str) -> Result<Vec<u8>, InputError> {
    let path = PathBuf::from(path_str);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!("Read {} bytes from {}", bytes.len(), path.display());
            Ok(bytes)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(InputError::FileNotFound { path }),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(InputError::PermissionDenied { path })
        }
        Err(source) => Err(InputError::Read { path, source }),
    }
}

async fn download(url: &str, timeout: Duration) -> Result<Vec<u8>, InputError> {
    info!("Downloading manuscript from: {}", url);
    let failed = |reason: String| InputError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            InputError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout.as_secs(),
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_detection() {
        assert!(is_url("https://example.com/book.md"));
        assert!(is_url("http://localhost:8080/a.md"));
        assert!(!is_url("chapters/one.md"));
        assert!(!is_url("ftp://example.com/a.md"));
    }

    #[tokio::test]
    async fn reads_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.md");
        std::fs::write(&path, "# Title\n").unwrap();
        let bytes = load_manuscript(path.to_str().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(bytes, b"# Title\n");
    }

    #[tokio::test]
    async fn missing_and_empty_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.md");
        let err = load_manuscript(missing.to_str().unwrap(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InputError::FileNotFound { .. }));

        let empty = dir.path().join("empty.md");
        std::fs::write(&empty, "").unwrap();
        let err = load_manuscript(empty.to_str().unwrap(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InputError::Empty { .. }));
    }
}
