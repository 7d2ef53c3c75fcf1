//! `dandiset.yaml` update (spec.md §6, SPEC_FULL.md §6 [SUPPLEMENT]), ported
//! from `_populate_dandiset_yaml` in `lincbrain/download.py`.
//!
//! The core does not author dandiset metadata (that's the out-of-scope
//! metadata-validation pipeline); it only decides, given already-rendered
//! bytes, whether and how to write them to disk under the same existence
//! policy vocabulary as a regular asset.

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};

use super::progress::{ProgressEvent, StatusKind};
use crate::error::EngineError;
use crate::utils::is_annex_sibling;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DandisetYamlExistence {
    Error,
    Skip,
    Overwrite,
    Refresh,
}

pub struct DandisetYamlRequest {
    pub path: PathBuf,
    /// The dandiset root, for annex-sibling detection.
    pub toplevel_path: PathBuf,
    pub contents: Vec<u8>,
    pub mtime: Option<DateTime<Utc>>,
    pub existence: DandisetYamlExistence,
}

/// Write (or skip/refuse writing) `dandiset.yaml`, emitting exactly one
/// terminal progress record.
pub async fn update_dandiset_yaml(
    req: &DandisetYamlRequest,
    emit: &mut dyn FnMut(ProgressEvent),
) -> Result<(), EngineError> {
    let existing = tokio::fs::read(&req.path).await.ok();
    if let Some(existing) = &existing {
        if existing == &req.contents {
            emit(ProgressEvent::Status {
                kind: StatusKind::Done,
                message: None,
            });
            return Ok(());
        }

        match req.existence {
            DandisetYamlExistence::Error => {
                return Err(EngineError::AlreadyExists {
                    path: req.path.display().to_string(),
                });
            }
            DandisetYamlExistence::Skip => {
                emit(ProgressEvent::Status {
                    kind: StatusKind::Skipped,
                    message: Some("already exists".to_string()),
                });
                return Ok(());
            }
            DandisetYamlExistence::Overwrite => {}
            DandisetYamlExistence::Refresh => {
                if is_annex_sibling(&req.toplevel_path) {
                    return Err(EngineError::AnnexRefreshForbidden {
                        path: req.path.display().to_string(),
                    });
                }
            }
        }
    }

    if let Some(parent) = req.path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&req.path, &req.contents).await?;

    if let Some(mtime) = req.mtime {
        let path = req.path.clone();
        let system_time = UNIX_EPOCH + std::time::Duration::from_secs(mtime.timestamp().max(0) as u64);
        tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(system_time))
        })
        .await
        .map_err(|e| EngineError::Other {
            message: format!("mtime task panicked: {e}"),
        })??;
    }

    emit(ProgressEvent::Status {
        kind: StatusKind::Done,
        message: None,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path, contents: &[u8], existence: DandisetYamlExistence) -> DandisetYamlRequest {
        DandisetYamlRequest {
            path: dir.join("dandiset.yaml"),
            toplevel_path: dir.to_path_buf(),
            contents: contents.to_vec(),
            mtime: None,
            existence,
        }
    }

    #[tokio::test]
    async fn writes_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), b"name: foo\n", DandisetYamlExistence::Error);
        let mut events = Vec::new();
        let mut emit = |e: ProgressEvent| events.push(e);
        update_dandiset_yaml(&req, &mut emit).await.unwrap();
        assert_eq!(tokio::fs::read(&req.path).await.unwrap(), b"name: foo\n");
    }

    #[tokio::test]
    async fn unchanged_contents_are_a_noop_even_under_error_policy() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("dandiset.yaml"), b"name: foo\n")
            .await
            .unwrap();
        let req = request(dir.path(), b"name: foo\n", DandisetYamlExistence::Error);
        let mut emit = |_: ProgressEvent| {};
        update_dandiset_yaml(&req, &mut emit).await.unwrap();
    }

    #[tokio::test]
    async fn error_policy_rejects_changed_contents() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("dandiset.yaml"), b"name: foo\n")
            .await
            .unwrap();
        let req = request(dir.path(), b"name: bar\n", DandisetYamlExistence::Error);
        let mut emit = |_: ProgressEvent| {};
        let result = update_dandiset_yaml(&req, &mut emit).await;
        assert!(matches!(result, Err(EngineError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn refresh_refuses_inside_annex() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("dandiset.yaml"), b"name: foo\n")
            .await
            .unwrap();
        tokio::fs::create_dir_all(dir.path().join(".git").join("annex"))
            .await
            .unwrap();
        let req = request(dir.path(), b"name: bar\n", DandisetYamlExistence::Refresh);
        let mut emit = |_: ProgressEvent| {};
        let result = update_dandiset_yaml(&req, &mut emit).await;
        assert!(matches!(result, Err(EngineError::AnnexRefreshForbidden { .. })));
    }
}
