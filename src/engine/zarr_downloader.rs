//! C5: ZarrDownloader — fans out FileDownloaders for a Zarr asset's entries,
//! folds their progress through a ProgressCombiner, reconciles the local
//! tree with the remote entry list, and verifies the aggregate checksum
//! (spec.md §4.5), ported from `_download_zarr` in `lincbrain/download.py`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as SyncMutex;

use futures::StreamExt;
use md5::{Digest, Md5};
use tokio::sync::Mutex as AsyncMutex;

use super::archive::{ByteStream, DigestAlgorithm, DigestMap, ZarrEntry};
use super::config::RetryConfig;
use super::file_downloader::{download_file, ByteSource, ExistencePolicy, FileDownloadRequest};
use super::progress::{ChecksumOutcome, ProgressEvent, StatusKind};
use super::progress_combiner::ProgressCombiner;
use super::zarr_checksum::{self, ChecksumEntry};
use crate::error::EngineError;
use crate::utils::is_excluded_dotfile_path;

/// Everything a `ZarrDownloader` invocation needs.
pub struct ZarrDownloadRequest {
    /// Local directory the Zarr asset is materialised into.
    pub zarr_root: PathBuf,
    /// The dandiset root, for annex-sibling detection in per-entry downloads.
    pub toplevel_path: PathBuf,
    pub existence: ExistencePolicy,
    /// Bounded worker pool size for this asset's entries (spec.md §5,
    /// default 4).
    pub jobs: usize,
    pub remote_checksum: String,
    pub retry: RetryConfig,
}

/// The byte-stream factory for one Zarr entry.
pub trait ZarrEntrySource: Send + Sync {
    fn open(&self, entry: &ZarrEntry, offset: u64) -> ByteStream;
}

struct EntrySource<'a> {
    entry: ZarrEntry,
    source: &'a dyn ZarrEntrySource,
}

impl ByteSource for EntrySource<'_> {
    fn open(&self, offset: u64) -> ByteStream {
        self.source.open(&self.entry, offset)
    }
}

/// Download every entry of a Zarr asset, reconcile the local tree, and
/// verify the aggregate checksum. `emit` receives the combined outer
/// progress stream (spec.md §4.6).
pub async fn download_zarr(
    req: &ZarrDownloadRequest,
    entries: Vec<ZarrEntry>,
    source: &(dyn ZarrEntrySource + Sync),
    mkdir_lock: &AsyncMutex<()>,
    emit: &mut (dyn FnMut(ProgressEvent) + Send),
) -> Result<(), EngineError> {
    tokio::fs::create_dir_all(&req.zarr_root).await?;

    let zarr_size: u64 = entries.iter().map(|e| e.size).sum();
    let combiner = SyncMutex::new(ProgressCombiner::new(zarr_size, entries.len()));
    let captured_digests: SyncMutex<Vec<ChecksumEntry>> = SyncMutex::new(Vec::new());
    let any_downloaded = AtomicBool::new(false);
    let aborted = AtomicBool::new(false);
    let emit = SyncMutex::new(emit);

    // FINISH_CURRENT (spec.md §4.5 step 4): once an entry errors, no new
    // entry is started, but everything already in flight runs to
    // completion. `buffer_unordered` polls up to `jobs` entries at once
    // without spawning a task, so the whole asset stays on one future tree
    // and `source`/`emit` never need to be `'static` or `Sync`-shared
    // across OS threads.
    let jobs = req.jobs.max(1);
    futures::stream::iter(entries.iter().cloned())
        .map(|source_entry| {
            let combiner = &combiner;
            let captured_digests = &captured_digests;
            let any_downloaded = &any_downloaded;
            let aborted = &aborted;
            let emit = &emit;
            let zarr_root = &req.zarr_root;
            let toplevel_path = &req.toplevel_path;
            let existence = req.existence;
            let retry = req.retry;
            async move {
                if aborted.load(Ordering::SeqCst) {
                    return;
                }
                let entry_path = source_entry.path.clone();
                let entry_size = source_entry.size;
                let mut digests = DigestMap::new();
                digests.insert(DigestAlgorithm::Md5, source_entry.md5.clone());
                let file_req = FileDownloadRequest {
                    final_path: zarr_root.join(&source_entry.path),
                    toplevel_path: toplevel_path.clone(),
                    expected_size: Some(entry_size),
                    expected_mtime: source_entry.mtime,
                    expected_digests: digests,
                    existence,
                };
                let entry_source = EntrySource {
                    entry: source_entry,
                    source,
                };

                let mut captured: Option<String> = None;
                let mut cb = |algo: &str, value: &str| {
                    if algo == "md5" {
                        captured = Some(value.to_string());
                    }
                };
                let mut emit_inner = |ev: ProgressEvent| {
                    let outer = combiner.lock().unwrap().feed(&entry_path, &ev);
                    let mut emit = emit.lock().unwrap();
                    for ev in outer {
                        (emit)(ev);
                    }
                };
                let result = download_file(
                    &file_req,
                    &entry_source,
                    mkdir_lock,
                    &retry,
                    &mut emit_inner,
                    Some(&mut cb),
                )
                .await;

                match &result {
                    Ok(()) => any_downloaded.store(true, Ordering::SeqCst),
                    Err(_) => aborted.store(true, Ordering::SeqCst),
                }

                if let Some(md5_hex) = captured {
                    let mut bytes = [0u8; 16];
                    if let Ok(decoded) = hex::decode(&md5_hex) {
                        if decoded.len() == 16 {
                            bytes.copy_from_slice(&decoded);
                        }
                    }
                    captured_digests.lock().unwrap().push(ChecksumEntry {
                        path: entry_path,
                        md5: bytes,
                        size: entry_size,
                    });
                }
            }
        })
        .buffer_unordered(jobs)
        .for_each(|_| async {})
        .await;

    let emit = emit.into_inner().unwrap();
    reconcile_tree(&req.zarr_root, &entries).await?;

    if any_downloaded.load(Ordering::SeqCst) {
        let mut captured = captured_digests.lock().unwrap().clone();
        let captured_paths: HashSet<String> = captured.iter().map(|e| e.path.clone()).collect();
        for entry in &entries {
            if captured_paths.contains(&entry.path) {
                continue;
            }
            let local_path = req.zarr_root.join(&entry.path);
            if let Ok(md5_hex) = compute_md5_of_file(&local_path).await {
                let mut bytes = [0u8; 16];
                if let Ok(decoded) = hex::decode(&md5_hex) {
                    if decoded.len() == 16 {
                        bytes.copy_from_slice(&decoded);
                    }
                }
                captured.push(ChecksumEntry {
                    path: entry.path.clone(),
                    md5: bytes,
                    size: entry.size,
                });
            }
        }

        let local_checksum = zarr_checksum::aggregate(&captured);
        if local_checksum == req.remote_checksum {
            emit(ProgressEvent::Checksum {
                outcome: ChecksumOutcome::Ok,
                status: None,
                message: None,
            });
        } else {
            let message = format!(
                "Zarr checksum: downloaded {local_checksum} != {}",
                req.remote_checksum
            );
            emit(ProgressEvent::Checksum {
                outcome: ChecksumOutcome::Differs,
                status: Some(StatusKind::Error),
                message: Some(message.clone()),
            });
            return Err(EngineError::ChecksumMismatch {
                expected: req.remote_checksum.clone(),
                actual: local_checksum,
            });
        }
    }

    if aborted.load(Ordering::SeqCst) {
        emit(ProgressEvent::Status {
            kind: StatusKind::Error,
            message: None,
        });
        return Err(EngineError::Other {
            message: "one or more Zarr entries failed".to_string(),
        });
    }

    emit(ProgressEvent::Status {
        kind: StatusKind::Done,
        message: None,
    });
    Ok(())
}

async fn compute_md5_of_file(path: &Path) -> Result<String, EngineError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Md5::digest(&bytes)))
}

/// Delete local files absent from `entries`, preserving the excluded
/// dotfile set, then remove newly-empty directories bottom-up (spec.md
/// §4.5). The zarr root itself is never removed.
async fn reconcile_tree(zarr_root: &Path, entries: &[ZarrEntry]) -> Result<(), EngineError> {
    let remote: HashSet<&str> = entries.iter().map(|e| e.path.as_str()).collect();

    let mut to_delete = Vec::new();
    for dirent in walkdir::WalkDir::new(zarr_root)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !dirent.file_type().is_file() {
            continue;
        }
        let relative = dirent
            .path()
            .strip_prefix(zarr_root)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        if is_excluded_dotfile_path(&relative) {
            continue;
        }
        if !remote.contains(relative.as_str()) {
            to_delete.push(dirent.path().to_path_buf());
        }
    }
    for path in to_delete {
        tokio::fs::remove_file(&path).await.ok();
    }

    // Bottom-up empty-directory removal: walkdir's `contents_first` visits
    // children before parents, so removing as we go never skips a directory
    // that only became empty this pass.
    for dirent in walkdir::WalkDir::new(zarr_root)
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
            .strip_prefix(zarr_root)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        if is_excluded_dotfile_path(&relative) {
            continue;
        }
        let _ = tokio::fs::remove_dir(dirent.path()).await;
    }

    Ok(())
}
