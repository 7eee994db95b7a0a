//! Job identity, lifecycle states and caller handles.

use crate::fingerprint::Fingerprint;
use crate::store::ArtifactRef;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identifier of one job record: `<fingerprint prefix>-<sequence>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(Arc<str>);

impl JobId {
    pub(crate) fn new(fingerprint: &Fingerprint, seq: u64) -> Self {
        Self(format!("{}-{seq}", fingerprint.short()).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, seq) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("invalid job id '{s}'"))?;
        let hex_ok = prefix.len() == 16 && prefix.bytes().all(|b| b.is_ascii_hexdigit());
        if !hex_ok || seq.parse::<u64>().is_err() {
            return Err(format!("invalid job id '{s}'"));
        }
        Ok(Self(s.into()))
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Observable state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    /// The handle refers to nothing the scheduler still remembers.
    Unknown,
}

impl JobState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
            JobState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `submit` hands back to a caller.
///
/// A handle is only a name; it never keeps a job or an artifact alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Handle {
    /// A queued, running or finished build.
    Job(JobId),
    /// Answered from the result cache; no job was created.
    Cached(ArtifactRef),
}

impl Handle {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Handle::Job(id) => Some(id),
            Handle::Cached(_) => None,
        }
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Handle::Cached(_))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Job(id) => write!(f, "job:{id}"),
            Handle::Cached(reference) => write!(f, "cached:{reference}"),
        }
    }
}

impl FromStr for Handle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once(':') {
            Some(("job", id)) => id.parse().map(Handle::Job),
            Some(("cached", hex)) => hex.parse().map(Handle::Cached),
            _ => Err(format!(
                "invalid handle '{s}' (expected job:<id> or cached:<sha256>)"
            )),
        }
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Point-in-time view of a job record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub fingerprint: Fingerprint,
    pub state: JobState,
    /// 0-based attempt number of this record.
    pub attempt: u32,
    /// Callers attached to the build.
    pub waiters: usize,
    /// Time spent in the queue so far (or until the job started).
    pub queued_for: Duration,
    /// Render time so far (or total, once finished).
    pub running_for: Option<Duration>,
    /// Set once the record is terminal and failed.
    pub error: Option<String>,
}

/// Cooperative cancellation flag shared between the scheduler and a renderer.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> JobId {
        JobId::new(&Fingerprint::of_bytes(b"job"), 42)
    }

    #[test]
    fn job_id_format() {
        let id = id();
        let (prefix, seq) = id.as_str().rsplit_once('-').unwrap();
        assert_eq!(prefix.len(), 16);
        assert_eq!(seq, "42");
        assert_eq!(id.as_str().parse::<JobId>().unwrap(), id);
        assert!("nope".parse::<JobId>().is_err());
        assert!("0123456789abcdef-x".parse::<JobId>().is_err());
    }

    #[test]
    fn handle_text_form_round_trips() {
        let job = Handle::Job(id());
        assert!(job.to_string().starts_with("job:"));
        assert_eq!(job.to_string().parse::<Handle>().unwrap(), job);

        let cached = Handle::Cached(ArtifactRef::of_bytes(b"%PDF-1.7"));
        assert!(cached.to_string().starts_with("cached:"));
        assert_eq!(cached.to_string().parse::<Handle>().unwrap(), cached);
        assert!(cached.is_cached());
        assert!(cached.job_id().is_none());

        assert!("pdf:123".parse::<Handle>().is_err());
    }

    #[test]
    fn handle_serialises_as_string() {
        let h = Handle::Job(id());
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{h}\""));
        let back: Handle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Unknown.is_terminal());
    }

    #[test]
    fn cancel_flag_is_shared() {
        let a = CancelFlag::new();
        let b = a.clone();
        assert!(!b.is_canceled());
        a.cancel();
        assert!(b.is_canceled());
    }
}
