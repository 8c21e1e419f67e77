//! Content-addressed blob storage with per-run manifests.
//!
//! Layout:
//! - `artifacts/blobs/<hh>/<hash>` — deduplicated blob bytes
//! - `runs/<run_id>/artifacts.manifest.json` — live manifest
//! - `runs/<run_id>/artifacts.manifest.archive-<n>.json` — archived slices
//!
//! Blob writes are collision-free by construction; manifest updates are
//! serialized per run.

use crate::artifact::{ArtifactRef, ArtifactType, Manifest};
use crate::errors::StoreError;
use crate::ident;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub struct ArtifactStore {
    blob_root: PathBuf,
    runs_root: PathBuf,
    manifest_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactStore {
    pub fn new(blob_root: impl Into<PathBuf>, runs_root: impl Into<PathBuf>) -> Self {
        Self {
            blob_root: blob_root.into(),
            runs_root: runs_root.into(),
            manifest_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store bytes and record a new artifact reference. Identical bytes share
    /// one blob; every call yields a distinct reference.
    pub fn put(
        &self,
        run_id: &str,
        producing_phase: &str,
        agent_id: &str,
        logical_name: &str,
        artifact_type: ArtifactType,
        bytes: &[u8],
    ) -> Result<ArtifactRef, StoreError> {
        let hash = ident::content_hash(bytes);
        self.write_blob(&hash, bytes)?;

        let artifact = ArtifactRef {
            artifact_id: Uuid::new_v4(),
            run_id: run_id.to_string(),
            producing_phase: producing_phase.to_string(),
            producing_agent: agent_id.to_string(),
            logical_name: logical_name.to_string(),
            artifact_type,
            blob_hash: hash,
            size: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let lock = self.run_lock(run_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut manifest = self.load_manifest(run_id)?;
        manifest.entries.push(artifact.clone());
        self.save_manifest(run_id, &manifest)?;

        Ok(artifact)
    }

    /// Load an artifact reference and its verified bytes.
    pub fn get(&self, run_id: &str, artifact_id: &Uuid) -> Result<(ArtifactRef, Vec<u8>), StoreError> {
        let manifest = self.load_manifest(run_id)?;
        let artifact = manifest
            .find_by_id(artifact_id)
            .cloned()
            .ok_or_else(|| StoreError::ArtifactNotFound {
                run_id: run_id.to_string(),
                artifact_id: artifact_id.to_string(),
            })?;
        let bytes = self.resolve_blob(&artifact.blob_hash)?;
        Ok((artifact, bytes))
    }

    /// Read blob bytes by hash, verifying integrity on the way out.
    pub fn resolve_blob(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(hash);
        if !path.exists() {
            return Err(StoreError::BlobNotFound {
                hash: hash.to_string(),
            });
        }
        let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        let actual = ident::content_hash(&bytes);
        if actual != hash {
            return Err(StoreError::Integrity {
                subject: format!("blob {hash}"),
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    /// Whether a blob with this hash is present.
    pub fn has_blob(&self, hash: &str) -> bool {
        self.blob_path(hash).exists()
    }

    /// Artifacts produced by a phase, in production order.
    pub fn list_by_phase(&self, run_id: &str, phase: &str) -> Result<Vec<ArtifactRef>, StoreError> {
        let manifest = self.load_manifest(run_id)?;
        Ok(manifest.for_phase(phase).into_iter().cloned().collect())
    }

    /// All live artifacts for a run.
    pub fn list_by_run(&self, run_id: &str) -> Result<Vec<ArtifactRef>, StoreError> {
        Ok(self.load_manifest(run_id)?.entries)
    }

    /// The live manifest for a run (empty if none exists yet).
    pub fn load_manifest(&self, run_id: &str) -> Result<Manifest, StoreError> {
        let path = self.manifest_path(run_id);
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let text = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        serde_json::from_str(&text).map_err(|e| StoreError::Serde {
            subject: format!("manifest for {run_id}"),
            source: e,
        })
    }

    /// Move manifest entries for phases *not* in `keep_phases` into an
    /// archive file. Blobs stay in place; only the live index shrinks.
    /// Returns the number of archived entries.
    pub fn archive_after(
        &self,
        run_id: &str,
        keep_phases: &[String],
    ) -> Result<usize, StoreError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let manifest = self.load_manifest(run_id)?;
        let (kept, archived): (Vec<ArtifactRef>, Vec<ArtifactRef>) = manifest
            .entries
            .into_iter()
            .partition(|e| keep_phases.contains(&e.producing_phase));

        if archived.is_empty() {
            return Ok(0);
        }

        let archive_path = self.next_archive_path(run_id)?;
        let archive = Manifest { entries: archived };
        write_json_atomic(&archive_path, &archive)?;
        self.save_manifest(run_id, &Manifest { entries: kept })?;

        Ok(archive.entries.len())
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.blob_root.join(ident::blob_rel_path(hash))
    }

    fn manifest_path(&self, run_id: &str) -> PathBuf {
        self.runs_root.join(run_id).join("artifacts.manifest.json")
    }

    fn next_archive_path(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.runs_root.join(run_id);
        let mut n = 1u32;
        loop {
            let candidate = dir.join(format!("artifacts.manifest.archive-{n}.json"));
            if !candidate.exists() {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    fn write_blob(&self, hash: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.blob_path(hash);
        if path.exists() {
            // Dedup: identical content is already present.
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    fn save_manifest(&self, run_id: &str, manifest: &Manifest) -> Result<(), StoreError> {
        let path = self.manifest_path(run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        write_json_atomic(&path, manifest)
    }

    fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .manifest_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Write JSON with the write-then-fsync-then-rename discipline.
pub(crate) fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StoreError::Serde {
        subject: path.display().to_string(),
        source: e,
    })?;
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}
