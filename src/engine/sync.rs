//! Post-download sync mode (spec.md §6, SPEC_FULL.md §6 [SUPPLEMENT]),
//! grounded in `Downloader.delete_for_sync` and `download()`'s `sync=True`
//! branch: after a successful download, anything locally present under the
//! download scope but not in the successfully-downloaded set is a candidate
//! for interactive deletion.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::utils::is_excluded_dotfile_path;

/// Asks the user whether to delete the listed orphaned paths. The "list"
/// sub-option from spec.md §6 is a concrete-confirmer concern (it reprints
/// and re-asks); the engine only needs a final yes/no.
pub trait SyncConfirmer: Send + Sync {
    fn confirm_delete(&self, orphans: &[PathBuf]) -> bool;
}

/// The default terminal confirmer: `[y/N/l]`, re-prompting after `l` lists
/// the candidates.
pub struct InteractiveConfirmer;

impl SyncConfirmer for InteractiveConfirmer {
    fn confirm_delete(&self, orphans: &[PathBuf]) -> bool {
        loop {
            eprint!(
                "{} local path(s) are absent from the remote. Delete them? [y/N/l] ",
                orphans.len()
            );
            io::stderr().flush().ok();
            let mut line = String::new();
            if io::stdin().read_line(&mut line).is_err() {
                return false;
            }
            match line.trim().to_lowercase().as_str() {
                "y" | "yes" => return true,
                "l" | "list" => {
                    for path in orphans {
                        eprintln!("  {}", path.display());
                    }
                    continue;
                }
                _ => return false,
            }
        }
    }
}

/// A confirmer that always answers the same way, for non-interactive runs
/// and tests.
pub struct FixedConfirmer(pub bool);

impl SyncConfirmer for FixedConfirmer {
    fn confirm_delete(&self, _orphans: &[PathBuf]) -> bool {
        self.0
    }
}

fn collect_orphans(output_path: &Path, downloaded: &HashSet<String>) -> Result<Vec<PathBuf>, EngineError> {
    let mut orphans = Vec::new();
    for dirent in walkdir::WalkDir::new(output_path)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !dirent.file_type().is_file() {
            continue;
        }
        let relative = dirent
            .path()
            .strip_prefix(output_path)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        if is_excluded_dotfile_path(&relative) {
            continue;
        }
        if !downloaded.contains(&relative) {
            orphans.push(dirent.path().to_path_buf());
        }
    }
    Ok(orphans)
}

/// Remove now-empty directories under `root`, bottom-up, never removing
/// `root` itself.
fn remove_empty_dirs(root: &Path) -> Result<(), EngineError> {
    for dirent in walkdir::WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !dirent.file_type().is_dir() {
            continue;
        }
        let relative = dirent
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        if is_excluded_dotfile_path(&relative) {
            continue;
        }
        let _ = std::fs::remove_dir(dirent.path());
    }
    Ok(())
}

/// Find locally-present files under `output_path` absent from `downloaded`,
/// confirm with the user, and delete them (recursively for any directory
/// that becomes empty as a result). Returns the paths actually deleted.
pub async fn sync(
    output_path: &Path,
    downloaded: &HashSet<String>,
    confirmer: &dyn SyncConfirmer,
) -> Result<Vec<PathBuf>, EngineError> {
    let output_path = output_path.to_path_buf();
    let downloaded = downloaded.clone();
    let scan_root = output_path.clone();
    let orphans =
        tokio::task::spawn_blocking(move || collect_orphans(&scan_root, &downloaded))
            .await
            .map_err(|e| EngineError::Other {
                message: format!("sync scan task panicked: {e}"),
            })??;

    if orphans.is_empty() || !confirmer.confirm_delete(&orphans) {
        return Ok(Vec::new());
    }

    for path in &orphans {
        tokio::fs::remove_file(path).await.ok();
    }

    let root = output_path.clone();
    tokio::task::spawn_blocking(move || remove_empty_dirs(&root))
        .await
        .map_err(|e| EngineError::Other {
            message: format!("sync cleanup task panicked: {e}"),
        })??;

    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn orphans_outside_downloaded_set_are_deleted_when_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("keep.txt"), b"a").await.unwrap();
        tokio::fs::write(dir.path().join("stale.txt"), b"b").await.unwrap();

        let mut downloaded = HashSet::new();
        downloaded.insert("keep.txt".to_string());

        let deleted = sync(dir.path(), &downloaded, &FixedConfirmer(true)).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(tokio::fs::metadata(dir.path().join("keep.txt")).await.is_ok());
        assert!(tokio::fs::metadata(dir.path().join("stale.txt")).await.is_err());
    }

    #[tokio::test]
    async fn declining_confirmation_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("stale.txt"), b"b").await.unwrap();
        let downloaded = HashSet::new();

        let deleted = sync(dir.path(), &downloaded, &FixedConfirmer(false)).await.unwrap();
        assert!(deleted.is_empty());
        assert!(tokio::fs::metadata(dir.path().join("stale.txt")).await.is_ok());
    }

    #[tokio::test]
    async fn dotfiles_are_never_orphan_candidates() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join(".git")).await.unwrap();
        tokio::fs::write(dir.path().join(".git").join("config"), b"x").await.unwrap();
        let downloaded = HashSet::new();

        let deleted = sync(dir.path(), &downloaded, &FixedConfirmer(true)).await.unwrap();
        assert!(deleted.is_empty());
    }
}
