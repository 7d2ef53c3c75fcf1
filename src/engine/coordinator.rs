//! The Coordinator (spec.md §2, §9): iterates the asset set, dispatches each
//! asset to a FileDownloader or ZarrDownloader by kind (spec.md §9
//! "Polymorphism over asset kinds" — a tagged variant dispatched by pattern
//! match at this boundary), merges their progress streams, and tallies the
//! run for the process exit status (spec.md §7).

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as SyncMutex;

use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;

use super::archive::{ArchiveClient, AssetKind, AssetRef, ByteStream, ZarrEntry};
use super::config::{JobsConfig, RetryConfig};
use super::file_downloader::{self, ByteSource, ExistencePolicy, FileDownloadRequest};
use super::progress::{ItemsSummary, ProgressEvent, StatusKind};
use super::zarr_downloader::{self, ZarrDownloadRequest, ZarrEntrySource};
use crate::error::EngineError;

/// Download report format (spec.md §6): PYOUT converts every per-asset
/// failure into an [`AssetOutcome`] record for the caller to tally; DEBUG
/// expects the caller to re-raise the first failure instead of reporting a
/// summary (spec.md §7's propagation policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pyout,
    Debug,
}

/// How [`PathFilter::pattern`] is matched against an asset's relative path
/// (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMatch {
    Exact,
    Glob,
}

/// Restricts a run to assets whose path matches `pattern` under `mode`.
pub struct PathFilter {
    pub pattern: String,
    pub mode: PathMatch,
}

impl PathFilter {
    fn compile(&self) -> Result<Box<dyn Fn(&str) -> bool + Send + Sync>, EngineError> {
        match self.mode {
            PathMatch::Exact => {
                let pattern = self.pattern.clone();
                Ok(Box::new(move |path: &str| path == pattern))
            }
            PathMatch::Glob => {
                let matcher = globset::Glob::new(&self.pattern)
                    .map_err(|e| EngineError::Other {
                        message: format!("invalid path filter glob {:?}: {e}", self.pattern),
                    })?
                    .compile_matcher();
                Ok(Box::new(move |path: &str| matcher.is_match(path)))
            }
        }
    }
}

/// Everything one Coordinator run needs.
pub struct CoordinatorRequest {
    /// Directory assets are materialised under (spec.md §6's filesystem
    /// layout — the caller has already appended the dandiset id, if any).
    pub output_root: PathBuf,
    pub existence: ExistencePolicy,
    pub jobs: JobsConfig,
    pub retry: RetryConfig,
    /// Restrict the run to assets matching this filter, if given (spec.md
    /// §6's path matching mode). `None` downloads every enumerated asset.
    pub path_filter: Option<PathFilter>,
}

/// One asset's outcome (spec.md §7: format DEBUG re-raises the first
/// exception, format PYOUT converts exceptions into error records — callers
/// need the actual errors, not just a count, to support either format).
pub struct AssetOutcome {
    pub path: String,
    pub error: Option<EngineError>,
}

/// The run-wide tally (spec.md §7's "process exit status is non-zero iff
/// any asset failed").
#[derive(Default)]
pub struct RunSummary {
    pub total_assets: usize,
    pub outcomes: Vec<AssetOutcome>,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    /// The first failure encountered, for format DEBUG's re-raise semantics.
    pub fn first_error(&self) -> Option<&EngineError> {
        self.outcomes.iter().find_map(|o| o.error.as_ref())
    }

    /// Remove and return the first failure, leaving every other outcome
    /// untouched. Lets format DEBUG propagate the owned error as a real
    /// `Err` (spec.md §7) without cloning [`EngineError`].
    pub fn take_first_error(&mut self) -> Option<EngineError> {
        self.outcomes.iter_mut().find_map(|o| o.error.take())
    }
}

struct BlobSource<'a> {
    client: &'a dyn ArchiveClient,
    asset: AssetRef,
}

impl ByteSource for BlobSource<'_> {
    fn open(&self, offset: u64) -> ByteStream {
        self.client.open_blob(&self.asset, offset)
    }
}

struct ZarrSource<'a> {
    client: &'a dyn ArchiveClient,
    asset: AssetRef,
}

impl ZarrEntrySource for ZarrSource<'_> {
    fn open(&self, entry: &ZarrEntry, offset: u64) -> ByteStream {
        self.client.open_zarr_entry(&self.asset, entry, offset)
    }
}

async fn dispatch_asset(
    client: &dyn ArchiveClient,
    asset: AssetRef,
    req: &CoordinatorRequest,
    mkdir_lock: &AsyncMutex<()>,
    emit: &mut dyn FnMut(ProgressEvent),
) -> Result<(), EngineError> {
    match asset.kind {
        AssetKind::Blob => {
            let file_req = FileDownloadRequest {
                final_path: req.output_root.join(&asset.path),
                toplevel_path: req.output_root.clone(),
                expected_size: Some(asset.size),
                expected_mtime: asset.mtime,
                expected_digests: asset.digests.clone(),
                existence: req.existence,
            };
            let source = BlobSource { client, asset };
            file_downloader::download_file(&file_req, &source, mkdir_lock, &req.retry, emit, None)
                .await
        }
        AssetKind::Zarr => {
            let (entries, remote_checksum) = client.list_zarr_entries(&asset).await?;
            let zarr_req = ZarrDownloadRequest {
                zarr_root: req.output_root.join(&asset.path),
                toplevel_path: req.output_root.clone(),
                existence: req.existence,
                jobs: req.jobs.jobs_per_zarr,
                remote_checksum,
                retry: req.retry,
            };
            let source = ZarrSource { client, asset };
            zarr_downloader::download_zarr(&zarr_req, entries, &source, mkdir_lock, emit).await
        }
    }
}

/// Run the whole download: enumerate, dispatch every asset onto a bounded
/// worker pool sized by `req.jobs.jobs`, and fold each asset's progress into
/// `emit`, tagged with its path.
///
/// `client.list_assets()` hands back a stream, not a collected list (spec.md
/// §5/§9's aggregation-while-iterating): assets are dispatched as they arrive
/// rather than after enumeration finishes, so the first download is never
/// blocked behind the whole manifest. `items_summary` grows with each item as
/// it is pulled off that stream and latches `finished` only once the stream
/// is exhausted.
pub async fn run(
    client: &dyn ArchiveClient,
    req: &CoordinatorRequest,
    items_summary: &ItemsSummary,
    emit: &mut (dyn FnMut(&str, ProgressEvent) + Send),
) -> Result<RunSummary, EngineError> {
    let path_matcher = req.path_filter.as_ref().map(PathFilter::compile).transpose()?;

    let asset_stream = client.list_assets().await;
    let mkdir_lock = AsyncMutex::new(());
    let emit = SyncMutex::new(emit);
    let outcomes = SyncMutex::new(Vec::new());
    let total_assets = AtomicUsize::new(0);
    let list_error = SyncMutex::new(None::<EngineError>);
    let jobs = req.jobs.jobs.max(1);

    asset_stream
        .map(|asset_result| {
            let mkdir_lock = &mkdir_lock;
            let emit = &emit;
            let outcomes = &outcomes;
            let items_summary = &items_summary;
            let total_assets = &total_assets;
            let list_error = &list_error;
            let path_matcher = &path_matcher;
            async move {
                let asset = match asset_result {
                    Ok(asset) => asset,
                    Err(e) => {
                        let mut slot = list_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        return;
                    }
                };
                if let Some(matches) = path_matcher {
                    if !matches(&asset.path) {
                        return;
                    }
                }
                items_summary.record_asset(Some(asset.size));
                total_assets.fetch_add(1, Ordering::Relaxed);

                let path = asset.path.clone();
                let mut emit_inner = |ev: ProgressEvent| {
                    let mut emit = emit.lock().unwrap();
                    (emit)(&path, ev);
                };
                let result = dispatch_asset(client, asset, req, mkdir_lock, &mut emit_inner).await;
                let error = result.err().map(|e| {
                    emit_inner(ProgressEvent::Status {
                        kind: StatusKind::Error,
                        message: Some(e.to_string()),
                    });
                    e
                });
                outcomes.lock().unwrap().push(AssetOutcome { path, error });
            }
        })
        .buffer_unordered(jobs)
        .for_each(|_| async {})
        .await;

    items_summary.finish();

    if let Some(e) = list_error.into_inner().unwrap() {
        return Err(e);
    }

    Ok(RunSummary {
        total_assets: total_assets.into_inner(),
        outcomes: outcomes.into_inner().unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::archive::testing::FakeArchiveClient;
    use crate::engine::archive::{AssetKind, DigestAlgorithm, DigestMap};

    fn jobs_config() -> JobsConfig {
        JobsConfig {
            jobs: 2,
            jobs_per_zarr: 2,
        }
    }

    #[tokio::test]
    async fn downloads_blob_and_zarr_assets_and_tallies_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = FakeArchiveClient::new();

        let mut blob_digests = DigestMap::new();
        let blob_data = b"hello coordinator".to_vec();
        let etag = crate::engine::multipart_etag::etag_of_bytes(&blob_data).unwrap();
        blob_digests.insert(DigestAlgorithm::DandiEtag, etag);
        client.assets.push(AssetRef {
            kind: AssetKind::Blob,
            path: "sub/blob.bin".to_string(),
            size: blob_data.len() as u64,
            mtime: None,
            digests: blob_digests,
        });
        client.blob_bytes.insert("sub/blob.bin".to_string(), blob_data);

        let req = CoordinatorRequest {
            output_root: dir.path().to_path_buf(),
            existence: ExistencePolicy::Overwrite,
            jobs: jobs_config(),
            retry: RetryConfig::default(),
            path_filter: None,
        };
        let summary = ItemsSummary::new();
        let mut events = Vec::new();
        let mut emit = |path: &str, ev: ProgressEvent| events.push((path.to_string(), ev));
        let result = run(&client, &req, &summary, &mut emit).await.unwrap();

        assert_eq!(result.total_assets, 1);
        assert_eq!(result.failed(), 0);
        assert!(result.all_succeeded());
        assert!(summary.snapshot().finished);
        assert_eq!(
            tokio::fs::read(dir.path().join("sub/blob.bin")).await.unwrap(),
            b"hello coordinator"
        );
    }

    #[tokio::test]
    async fn failed_asset_is_tallied_without_aborting_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = FakeArchiveClient::new();
        client.assets.push(AssetRef {
            kind: AssetKind::Blob,
            path: "already-there.bin".to_string(),
            size: 5,
            mtime: None,
            digests: DigestMap::new(),
        });
        tokio::fs::write(dir.path().join("already-there.bin"), b"x")
            .await
            .unwrap();
        client
            .blob_bytes
            .insert("already-there.bin".to_string(), vec![0u8; 5]);

        let req = CoordinatorRequest {
            output_root: dir.path().to_path_buf(),
            existence: ExistencePolicy::Error,
            jobs: jobs_config(),
            retry: RetryConfig::default(),
            path_filter: None,
        };
        let summary = ItemsSummary::new();
        let mut events = Vec::new();
        let mut emit = |path: &str, ev: ProgressEvent| events.push((path.to_string(), ev));
        let result = run(&client, &req, &summary, &mut emit).await.unwrap();

        assert_eq!(result.total_assets, 1);
        assert_eq!(result.failed(), 1);
        assert!(matches!(
            result.first_error(),
            Some(EngineError::AlreadyExists { .. })
        ));
        assert!(events
            .iter()
            .any(|(_, ev)| matches!(ev, ProgressEvent::Status { kind: StatusKind::Error, .. })));
    }

    #[tokio::test]
    async fn path_filter_restricts_which_assets_are_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = FakeArchiveClient::new();
        for path in ["sub-01/a.bin", "sub-01/b.bin", "sub-02/a.bin"] {
            client.assets.push(AssetRef {
                kind: AssetKind::Blob,
                path: path.to_string(),
                size: 1,
                mtime: None,
                digests: DigestMap::new(),
            });
            client.blob_bytes.insert(path.to_string(), vec![0u8]);
        }

        let req = CoordinatorRequest {
            output_root: dir.path().to_path_buf(),
            existence: ExistencePolicy::Overwrite,
            jobs: jobs_config(),
            retry: RetryConfig::default(),
            path_filter: Some(PathFilter {
                pattern: "sub-01/*".to_string(),
                mode: PathMatch::Glob,
            }),
        };
        let summary = ItemsSummary::new();
        let mut emit = |_: &str, _: ProgressEvent| {};
        let result = run(&client, &req, &summary, &mut emit).await.unwrap();

        assert_eq!(result.total_assets, 2);
        assert!(result
            .outcomes
            .iter()
            .all(|o| o.path.starts_with("sub-01/")));
    }

    #[tokio::test]
    async fn take_first_error_removes_only_that_outcomes_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = FakeArchiveClient::new();
        client.assets.push(AssetRef {
            kind: AssetKind::Blob,
            path: "already-there.bin".to_string(),
            size: 1,
            mtime: None,
            digests: DigestMap::new(),
        });
        tokio::fs::write(dir.path().join("already-there.bin"), b"x")
            .await
            .unwrap();
        client
            .blob_bytes
            .insert("already-there.bin".to_string(), vec![0u8]);

        let req = CoordinatorRequest {
            output_root: dir.path().to_path_buf(),
            existence: ExistencePolicy::Error,
            jobs: jobs_config(),
            retry: RetryConfig::default(),
            path_filter: None,
        };
        let summary = ItemsSummary::new();
        let mut emit = |_: &str, _: ProgressEvent| {};
        let mut result = run(&client, &req, &summary, &mut emit).await.unwrap();

        let taken = result.take_first_error();
        assert!(matches!(taken, Some(EngineError::AlreadyExists { .. })));
        assert!(result.first_error().is_none());
    }
}
