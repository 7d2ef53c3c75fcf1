//! C3: DownloadDirectory — the resumable, lock-protected workspace a single
//! file or Zarr entry is downloaded into before being published atomically
//! (spec.md §4.3), ported from `DownloadDirectory.__enter__`/`__exit__` in
//! `lincbrain/download.py`.

use std::path::{Path, PathBuf};

use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::archive::DigestMap;
use crate::error::EngineError;

#[derive(Debug, Serialize, Deserialize, Default)]
struct ChecksumManifest {
    digests: Vec<(String, String)>,
}

/// The `<target>.dandidownload/` workspace for one file.
///
/// Holding a `DownloadDirectory` means holding its advisory lock; the lock is
/// released when the value is dropped, so every early-return path (including
/// error propagation via `?`) releases it for free.
pub struct DownloadDirectory {
    target: PathBuf,
    workspace: PathBuf,
    _lock_file: File,
}

fn workspace_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".dandidownload");
    target.with_file_name(name)
}

impl DownloadDirectory {
    /// Open (creating if needed) the workspace for `target` and take its
    /// exclusive lock without blocking. Returns [`EngineError::LockBusy`] if
    /// another process already holds it.
    pub async fn open(target: &Path) -> Result<Self, EngineError> {
        let workspace = workspace_path(target);
        fs::create_dir_all(&workspace).await?;

        let lock_path = workspace.join("lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .await?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(_) => {
                return Err(EngineError::LockBusy {
                    path: target.display().to_string(),
                });
            }
        }

        Ok(Self {
            target: target.to_path_buf(),
            workspace,
            _lock_file: lock_file,
        })
    }

    /// The partial-download file inside the workspace.
    pub fn partial_path(&self) -> PathBuf {
        self.workspace.join("file")
    }

    fn checksum_path(&self) -> PathBuf {
        self.workspace.join("checksum")
    }

    /// Bytes already present in the partial file, i.e. the resume offset.
    pub async fn resume_offset(&self) -> Result<u64, EngineError> {
        match fs::metadata(self.partial_path()).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Digests recorded for a previous, interrupted attempt, if any.
    pub async fn recorded_digests(&self) -> Result<Option<DigestMap>, EngineError> {
        match fs::read(self.checksum_path()).await {
            Ok(bytes) => {
                let manifest: ChecksumManifest = serde_json::from_slice(&bytes)?;
                Ok(Some(DigestMap::from_pairs(manifest.digests)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a resumed partial download is still valid: the recorded
    /// digests (if any) and what the archive currently reports for this
    /// asset must share at least one algorithm, and agree on every algorithm
    /// they share. A mismatch on any shared algorithm — or no prior record —
    /// means start over from offset 0.
    pub async fn can_resume(&self, remote_digests: &DigestMap) -> Result<bool, EngineError> {
        if self.resume_offset().await? == 0 {
            return Ok(false);
        }
        match self.recorded_digests().await? {
            Some(recorded) if !recorded.is_empty() => {
                Ok(recorded.shares_matching_pair_with(remote_digests))
            }
            _ => Ok(false),
        }
    }

    /// Discard whatever partial bytes exist and start this workspace clean.
    pub async fn reset(&self) -> Result<(), EngineError> {
        match fs::remove_file(self.partial_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.checksum_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Open the partial file for appending (creating it if this is a fresh
    /// attempt).
    pub async fn open_for_append(&self) -> Result<File, EngineError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partial_path())
            .await
            .map_err(Into::into)
    }

    /// Persist the digests accumulated so far, so a crash mid-transfer can
    /// be resumed and re-verified on the next run.
    pub async fn save_digests(&self, digests: &DigestMap) -> Result<(), EngineError> {
        let manifest = ChecksumManifest {
            digests: digests.to_pairs(),
        };
        let body = serde_json::to_vec_pretty(&manifest)?;
        let tmp = self.workspace.join("checksum.tmp");
        let mut f = File::create(&tmp).await?;
        f.write_all(&body).await?;
        f.flush().await?;
        fs::rename(&tmp, self.checksum_path()).await?;
        Ok(())
    }

    /// Atomically publish the completed download to its final path and
    /// remove the workspace. Mirrors `Path.replace()` in the original, with
    /// the `IsADirectoryError` fallback: if `target` is itself a directory
    /// (e.g. a stale Zarr placeholder), it is removed before the rename is
    /// retried.
    pub async fn publish(self, mtime: Option<std::time::SystemTime>) -> Result<(), EngineError> {
        let partial = self.partial_path();
        match fs::rename(&partial, &self.target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Other || is_directory_conflict(&e) => {
                if fs::metadata(&self.target).await.map(|m| m.is_dir()).unwrap_or(false) {
                    fs::remove_dir_all(&self.target).await?;
                    fs::rename(&partial, &self.target).await?;
                } else {
                    return Err(e.into());
                }
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(mtime) = mtime {
            let target = self.target.clone();
            let _ = tokio::task::spawn_blocking(move || {
                let _ = filetime::set_file_mtime(&target, filetime::FileTime::from_system_time(mtime));
            })
            .await;
        }
        fs::remove_dir_all(&self.workspace).await.ok();
        Ok(())
    }
}

fn is_directory_conflict(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == 21 /* EISDIR */ || code == 17 /* EEXIST, some platforms */
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::archive::DigestAlgorithm;

    #[tokio::test]
    async fn fresh_workspace_has_no_resume_state() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub-01.nwb");
        let ws = DownloadDirectory::open(&target).await.unwrap();
        assert_eq!(ws.resume_offset().await.unwrap(), 0);
        assert!(ws.recorded_digests().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_open_is_lock_busy() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub-01.nwb");
        let _first = DownloadDirectory::open(&target).await.unwrap();
        let second = DownloadDirectory::open(&target).await;
        assert!(matches!(second, Err(EngineError::LockBusy { .. })));
    }

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub-01.nwb");
        {
            let _first = DownloadDirectory::open(&target).await.unwrap();
        }
        let second = DownloadDirectory::open(&target).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn resume_requires_matching_digest_pair() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub-01.nwb");
        let ws = DownloadDirectory::open(&target).await.unwrap();
        ws.open_for_append()
            .await
            .unwrap()
            .write_all(b"partial")
            .await
            .unwrap();

        let mut saved = DigestMap::new();
        saved.insert(DigestAlgorithm::Sha256, "abc123");
        ws.save_digests(&saved).await.unwrap();

        let mut matching = DigestMap::new();
        matching.insert(DigestAlgorithm::Sha256, "abc123");
        assert!(ws.can_resume(&matching).await.unwrap());

        let mut mismatched = DigestMap::new();
        mismatched.insert(DigestAlgorithm::Sha256, "different");
        assert!(!ws.can_resume(&mismatched).await.unwrap());
    }

    #[tokio::test]
    async fn publish_moves_file_and_removes_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub-01.nwb");
        let ws = DownloadDirectory::open(&target).await.unwrap();
        ws.open_for_append()
            .await
            .unwrap()
            .write_all(b"hello")
            .await
            .unwrap();
        let workspace = workspace_path(&target);
        ws.publish(None).await.unwrap();

        assert_eq!(fs::read(&target).await.unwrap(), b"hello");
        assert!(fs::metadata(&workspace).await.is_err());
    }
}
