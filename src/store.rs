//! Content-addressed artifact storage.
//!
//! Every rendered PDF lands here, keyed by the SHA-256 of its bytes
//! ([`ArtifactRef`]). Storing the same bytes twice yields the same reference
//! and a single copy.
//!
//! ## Lifetime
//!
//! Artifacts are reference counted through [`ArtifactPin`] guards. The
//! result cache, running jobs and finished job records each hold a pin; when
//! the last pin drops the artifact becomes collectable and the next
//! [`ArtifactStore::sweep`] removes it. [`ArtifactStore::delete`] refuses to
//! remove a pinned artifact.
//!
//! ## Backends
//!
//! * [`ArtifactStore::in_memory`] keeps blobs in RAM.
//! * [`ArtifactStore::open`] writes blobs below a directory as
//!   `<dir>/<hex[0..2]>/<hex>.pdf`, atomically (temp file + rename).
//!
//! All mutations of one reference, including its file on disk, happen while
//! that reference's index shard is locked, so a concurrent `store` and
//! `delete` of the same bytes cannot interleave.

use crate::error::BuildError;
use crate::fingerprint::decode_digest;
use crate::job::JobId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

const ARTIFACT_EXT: &str = "pdf";

/// Content address of a stored artifact (SHA-256 of its bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactRef([u8; 32]);

impl ArtifactRef {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactRef({})", self.short())
    }
}

impl FromStr for ArtifactRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_digest(s).map(Self)
    }
}

impl Serialize for ArtifactRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ArtifactRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Metadata of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub reference: ArtifactRef,
    pub size_bytes: u64,
    /// The job that first produced these bytes. `None` for artifacts found
    /// on disk when the store was opened.
    pub produced_by: Option<JobId>,
}

enum Blob {
    Memory(Arc<[u8]>),
    Disk(PathBuf),
}

struct Slot {
    pins: usize,
    meta: Artifact,
    blob: Blob,
}

struct Inner {
    index: DashMap<ArtifactRef, Slot>,
    root: Option<PathBuf>,
}

/// Content-addressed, pin-counted artifact storage. Cheap to clone.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("root", &self.inner.root)
            .field("artifacts", &self.inner.index.len())
            .finish()
    }
}

impl ArtifactStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                index: DashMap::new(),
                root: None,
            }),
        }
    }

    /// Open (or create) a directory-backed store.
    ///
    /// Artifacts already present are indexed unpinned, so they stay
    /// retrievable until the next sweep. Leftover temp files are removed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BuildError> {
        let root = dir.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            BuildError::internal(format!(
                "cannot create artifact directory {}: {e}",
                root.display()
            ))
        })?;

        let index = DashMap::new();
        for (reference, path, size_bytes) in scan_dir(&root)? {
            index.insert(
                reference,
                Slot {
                    pins: 0,
                    meta: Artifact {
                        reference,
                        size_bytes,
                        produced_by: None,
                    },
                    blob: Blob::Disk(path),
                },
            );
        }
        debug!("Opened artifact store {} ({} artifacts)", root.display(), index.len());

        Ok(Self {
            inner: Arc::new(Inner {
                index,
                root: Some(root),
            }),
        })
    }

    /// Store `bytes`, returning a pin on the (possibly pre-existing) artifact.
    pub fn store(&self, bytes: Vec<u8>, produced_by: Option<JobId>) -> Result<ArtifactPin, BuildError> {
        let reference = ArtifactRef::of_bytes(&bytes);
        match self.inner.index.entry(reference) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().pins += 1;
                debug!("Artifact {}: already stored", reference.short());
            }
            Entry::Vacant(vacant) => {
                let size_bytes = bytes.len() as u64;
                let blob = match &self.inner.root {
                    None => Blob::Memory(bytes.into()),
                    Some(root) => Blob::Disk(write_atomic(root, &reference, &bytes)?),
                };
                vacant.insert(Slot {
                    pins: 1,
                    meta: Artifact {
                        reference,
                        size_bytes,
                        produced_by,
                    },
                    blob,
                });
                debug!("Artifact {}: stored ({} bytes)", reference.short(), size_bytes);
            }
        }
        Ok(ArtifactPin {
            store: Arc::clone(&self.inner),
            reference,
        })
    }

    /// Read an artifact's bytes.
    pub fn retrieve(&self, reference: &ArtifactRef) -> Result<Arc<[u8]>, BuildError> {
        let slot = self
            .inner
            .index
            .get(reference)
            .ok_or_else(|| BuildError::not_found(format!("artifact {reference}")))?;
        match &slot.blob {
            Blob::Memory(bytes) => Ok(Arc::clone(bytes)),
            Blob::Disk(path) => std::fs::read(path).map(Arc::from).map_err(|e| {
                BuildError::internal(format!("cannot read artifact {}: {e}", path.display()))
            }),
        }
    }

    pub fn metadata(&self, reference: &ArtifactRef) -> Option<Artifact> {
        self.inner.index.get(reference).map(|s| s.meta.clone())
    }

    pub fn contains(&self, reference: &ArtifactRef) -> bool {
        self.inner.index.contains_key(reference)
    }

    /// Current pin count; 0 for unknown references.
    pub fn pins(&self, reference: &ArtifactRef) -> usize {
        self.inner.index.get(reference).map_or(0, |s| s.pins)
    }

    /// Take another pin on an artifact that is already stored.
    pub fn pin(&self, reference: &ArtifactRef) -> Option<ArtifactPin> {
        let mut slot = self.inner.index.get_mut(reference)?;
        slot.pins += 1;
        Some(ArtifactPin {
            store: Arc::clone(&self.inner),
            reference: *reference,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.index.is_empty()
    }

    /// Remove an unpinned artifact.
    pub fn delete(&self, reference: &ArtifactRef) -> Result<(), BuildError> {
        match self.inner.index.entry(*reference) {
            Entry::Vacant(_) => Err(BuildError::not_found(format!("artifact {reference}"))),
            Entry::Occupied(slot) => {
                let pins = slot.get().pins;
                if pins > 0 {
                    return Err(BuildError::InUse {
                        reference: reference.to_hex(),
                        pins,
                    });
                }
                if let Blob::Disk(path) = &slot.get().blob {
                    remove_file(path)?;
                }
                slot.remove();
                debug!("Artifact {}: deleted", reference.short());
                Ok(())
            }
        }
    }

    /// Remove every unpinned artifact. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let candidates: Vec<ArtifactRef> = self
            .inner
            .index
            .iter()
            .filter(|slot| slot.pins == 0)
            .map(|slot| *slot.key())
            .collect();

        let mut removed = 0;
        for reference in candidates {
            match self.delete(&reference) {
                Ok(()) => removed += 1,
                // Re-pinned or removed since the scan.
                Err(BuildError::InUse { .. } | BuildError::NotFound { .. }) => {}
                Err(e) => warn!("Artifact {}: sweep failed: {}", reference.short(), e),
            }
        }
        if removed > 0 {
            debug!("Swept {} unpinned artifacts", removed);
        }
        removed
    }
}

/// One counted reference on a stored artifact.
///
/// Cloning takes another pin; dropping releases it.
pub struct ArtifactPin {
    store: Arc<Inner>,
    reference: ArtifactRef,
}

impl ArtifactPin {
    pub fn reference(&self) -> ArtifactRef {
        self.reference
    }

    pub fn artifact(&self) -> Option<Artifact> {
        self.store.index.get(&self.reference).map(|s| s.meta.clone())
    }

    pub fn size_bytes(&self) -> u64 {
        self.store
            .index
            .get(&self.reference)
            .map_or(0, |s| s.meta.size_bytes)
    }
}

impl Clone for ArtifactPin {
    fn clone(&self) -> Self {
        if let Some(mut slot) = self.store.index.get_mut(&self.reference) {
            slot.pins += 1;
        }
        Self {
            store: Arc::clone(&self.store),
            reference: self.reference,
        }
    }
}

impl Drop for ArtifactPin {
    fn drop(&mut self) {
        if let Some(mut slot) = self.store.index.get_mut(&self.reference) {
            slot.pins = slot.pins.saturating_sub(1);
        }
    }
}

impl fmt::Debug for ArtifactPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactPin({})", self.reference.short())
    }
}

// ── Disk layout ──────────────────────────────────────────────────────────

fn artifact_path(root: &Path, reference: &ArtifactRef) -> PathBuf {
    let hex = reference.to_hex();
    root.join(&hex[..2]).join(format!("{hex}.{ARTIFACT_EXT}"))
}

fn write_atomic(root: &Path, reference: &ArtifactRef, bytes: &[u8]) -> Result<PathBuf, BuildError> {
    let path = artifact_path(root, reference);
    let io_err = |e: std::io::Error| {
        BuildError::internal(format!("cannot write artifact {}: {e}", path.display()))
    };

    let parent = path.parent().unwrap_or(root);
    std::fs::create_dir_all(parent).map_err(io_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".incoming-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(&path).map_err(|e| io_err(e.error))?;
    Ok(path)
}

fn remove_file(path: &Path) -> Result<(), BuildError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::internal(format!(
            "cannot remove artifact {}: {e}",
            path.display()
        ))),
    }
}

/// Index `<root>/<xx>/<hex>.pdf` files; delete abandoned temp files.
fn scan_dir(root: &Path) -> Result<Vec<(ArtifactRef, PathBuf, u64)>, BuildError> {
    let io_err = |e: std::io::Error| {
        BuildError::internal(format!("cannot scan artifact directory {}: {e}", root.display()))
    };

    let mut found = Vec::new();
    for shard in std::fs::read_dir(root).map_err(io_err)? {
        let shard = shard.map_err(io_err)?;
        if !shard.file_type().map_err(io_err)?.is_dir() {
            continue;
        }
        for file in std::fs::read_dir(shard.path()).map_err(io_err)? {
            let file = file.map_err(io_err)?;
            let path = file.path();
            let name = file.file_name().to_string_lossy().into_owned();

            if name.starts_with(".incoming-") {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Cannot remove temp file {}: {}", path.display(), e);
                }
                continue;
            }

            let Some(stem) = name.strip_suffix(&format!(".{ARTIFACT_EXT}")) else {
                continue;
            };
            let Ok(reference) = stem.parse::<ArtifactRef>() else {
                continue;
            };
            let size = file.metadata().map_err(io_err)?.len();
            found.push((reference, path, size));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    const PDF: &[u8] = b"%PDF-1.7\n1 0 obj\n<<>>\nendobj\n%%EOF\n";

    fn job() -> JobId {
        JobId::new(&Fingerprint::of_bytes(b"store"), 1)
    }

    #[test]
    fn identical_bytes_share_a_reference() {
        let store = ArtifactStore::in_memory();
        let a = store.store(PDF.to_vec(), Some(job())).unwrap();
        let b = store.store(PDF.to_vec(), None).unwrap();
        assert_eq!(a.reference(), b.reference());
        assert_eq!(a.reference(), ArtifactRef::of_bytes(PDF));
        assert_eq!(store.len(), 1);
        assert_eq!(store.pins(&a.reference()), 2);

        let meta = store.metadata(&a.reference()).unwrap();
        assert_eq!(meta.size_bytes, PDF.len() as u64);
        assert_eq!(meta.produced_by, Some(job()));
    }

    #[test]
    fn retrieve_returns_bytes_or_not_found() {
        let store = ArtifactStore::in_memory();
        let pin = store.store(PDF.to_vec(), None).unwrap();
        assert_eq!(&*store.retrieve(&pin.reference()).unwrap(), PDF);

        let missing = ArtifactRef::of_bytes(b"nothing");
        assert!(matches!(
            store.retrieve(&missing),
            Err(BuildError::NotFound { .. })
        ));
    }

    #[test]
    fn pinned_artifacts_cannot_be_deleted() {
        let store = ArtifactStore::in_memory();
        let pin = store.store(PDF.to_vec(), None).unwrap();
        let reference = pin.reference();
        let second = pin.clone();

        match store.delete(&reference) {
            Err(BuildError::InUse { pins, .. }) => assert_eq!(pins, 2),
            other => panic!("expected InUse, got {other:?}"),
        }

        drop(pin);
        assert!(store.delete(&reference).is_err());
        drop(second);
        assert_eq!(store.pins(&reference), 0);
        store.delete(&reference).unwrap();
        assert!(!store.contains(&reference));
        assert!(matches!(
            store.delete(&reference),
            Err(BuildError::NotFound { .. })
        ));
    }

    #[test]
    fn sweep_removes_only_unpinned() {
        let store = ArtifactStore::in_memory();
        let kept = store.store(PDF.to_vec(), None).unwrap();
        let dropped = store.store(b"%PDF-1.4 other".to_vec(), None).unwrap();
        let dropped_ref = dropped.reference();
        drop(dropped);

        assert_eq!(store.sweep(), 1);
        assert!(store.contains(&kept.reference()));
        assert!(!store.contains(&dropped_ref));
        assert_eq!(store.sweep(), 0);
    }

    #[test]
    fn pin_existing_artifact() {
        let store = ArtifactStore::in_memory();
        let first = store.store(PDF.to_vec(), None).unwrap();
        let reference = first.reference();
        drop(first);

        let again = store.pin(&reference).unwrap();
        assert_eq!(store.pins(&reference), 1);
        assert_eq!(again.size_bytes(), PDF.len() as u64);
        assert!(store.pin(&ArtifactRef::of_bytes(b"x")).is_none());
    }

    #[test]
    fn disk_backend_layout_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let reference;
        {
            let store = ArtifactStore::open(dir.path()).unwrap();
            let pin = store.store(PDF.to_vec(), Some(job())).unwrap();
            reference = pin.reference();

            let hex = reference.to_hex();
            let path = dir.path().join(&hex[..2]).join(format!("{hex}.pdf"));
            assert_eq!(std::fs::read(&path).unwrap(), PDF);
            assert_eq!(&*store.retrieve(&reference).unwrap(), PDF);
        }

        // Abandoned temp file from an interrupted write.
        let hex = reference.to_hex();
        let stray = dir.path().join(&hex[..2]).join(".incoming-abc.tmp");
        std::fs::write(&stray, b"partial").unwrap();

        let reopened = ArtifactStore::open(dir.path()).unwrap();
        assert!(!stray.exists());
        assert_eq!(reopened.len(), 1);
        let meta = reopened.metadata(&reference).unwrap();
        assert_eq!(meta.produced_by, None);
        assert_eq!(meta.size_bytes, PDF.len() as u64);
        assert_eq!(&*reopened.retrieve(&reference).unwrap(), PDF);

        assert_eq!(reopened.sweep(), 1);
        let path = dir.path().join(&hex[..2]).join(format!("{hex}.pdf"));
        assert!(!path.exists());
    }

    #[test]
    fn artifact_ref_parse_and_serde() {
        let r = ArtifactRef::of_bytes(PDF);
        assert_eq!(r.to_hex().parse::<ArtifactRef>().unwrap(), r);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(serde_json::from_str::<ArtifactRef>(&json).unwrap(), r);
    }
}
