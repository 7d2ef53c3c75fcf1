//! C4: FileDownloader — downloads a single blob (spec.md §4.4), ported from
//! `_download_file` in `lincbrain/download.py`.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::{Digest, Md5};
use rand::Rng;
use sha2::Sha256;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use super::archive::{ByteStream, DigestAlgorithm, DigestMap};
use super::config::RetryConfig;
use super::download_directory::DownloadDirectory;
use super::multipart_etag::MultipartEtag;
use super::progress::{ChecksumOutcome, ProgressEvent, StatusKind};
use crate::error::EngineError;
use crate::utils::is_annex_sibling;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistencePolicy {
    Error,
    Skip,
    Overwrite,
    OverwriteDifferent,
    Refresh,
}

/// Everything one `FileDownloader` invocation needs (spec.md §4.4 inputs).
pub struct FileDownloadRequest {
    pub final_path: PathBuf,
    /// The dandiset (or Zarr asset) root, used to detect an annex sibling.
    pub toplevel_path: PathBuf,
    pub expected_size: Option<u64>,
    pub expected_mtime: Option<DateTime<Utc>>,
    pub expected_digests: DigestMap,
    pub existence: ExistencePolicy,
}

/// The byte-stream factory an archive client (or test double) provides.
pub trait ByteSource: Send + Sync {
    fn open(&self, offset: u64) -> ByteStream;
}

enum StreamingDigest {
    DandiEtag(MultipartEtag),
    Sha256(Sha256),
    Md5(Md5),
}

impl StreamingDigest {
    fn choose(digests: &DigestMap, size: Option<u64>) -> Option<Self> {
        if let (Some(size), true) = (size, digests.contains(DigestAlgorithm::DandiEtag)) {
            if let Ok(etag) = MultipartEtag::new(size) {
                return Some(StreamingDigest::DandiEtag(etag));
            }
        }
        if digests.contains(DigestAlgorithm::Sha256) {
            return Some(StreamingDigest::Sha256(Sha256::new()));
        }
        if digests.contains(DigestAlgorithm::Md5) {
            return Some(StreamingDigest::Md5(Md5::new()));
        }
        None
    }

    fn feed(&mut self, offset: u64, chunk: &[u8]) -> Result<(), EngineError> {
        match self {
            StreamingDigest::DandiEtag(etag) => etag.update_streaming(offset, chunk),
            StreamingDigest::Sha256(h) => {
                h.update(chunk);
                Ok(())
            }
            StreamingDigest::Md5(h) => {
                h.update(chunk);
                Ok(())
            }
        }
    }

    fn finalize(self) -> Result<(DigestAlgorithm, String), EngineError> {
        match self {
            StreamingDigest::DandiEtag(etag) => Ok((DigestAlgorithm::DandiEtag, etag.finalize()?)),
            StreamingDigest::Sha256(h) => Ok((DigestAlgorithm::Sha256, hex::encode(h.finalize()))),
            StreamingDigest::Md5(h) => Ok((DigestAlgorithm::Md5, hex::encode(h.finalize()))),
        }
    }
}

/// Extract the embedded sha256 hex from a git-annex `SHA256E`-keyed symlink
/// target, if `path` is such a symlink.
fn annex_sha256e_digest(path: &Path) -> Option<String> {
    let target = std::fs::read_link(path).ok()?;
    let target = target.to_str()?;
    let idx = target.rfind("SHA256E-")?;
    let rest = &target[idx + "SHA256E-".len()..];
    let dashdash = rest.find("--")?;
    let after = &rest[dashdash + 2..];
    let hex_end = after.find('.').unwrap_or(after.len());
    let hex = &after[..hex_end];
    if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hex.to_lowercase())
    } else {
        None
    }
}

async fn compute_etag_of_file(path: &Path) -> Result<String, EngineError> {
    let meta = tokio::fs::metadata(path).await?;
    let mut etag = MultipartEtag::new(meta.len())?;
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 8 * 1024 * 1024];
    let mut offset = 0u64;
    loop {
        let n = tokio::io::AsyncReadExt::read(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        etag.update_streaming(offset, &buf[..n])?;
        offset += n as u64;
    }
    etag.finalize()
}

async fn compute_md5_of_file(path: &Path) -> Result<String, EngineError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; 8 * 1024 * 1024];
    let mut hasher = Md5::new();
    loop {
        let n = tokio::io::AsyncReadExt::read(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether an existing file at `req.final_path` matches `req.expected_digests`
/// closely enough to skip redownloading it (OVERWRITE_DIFFERENT rule (i)-(iii),
/// spec.md §4.4).
async fn locally_matches(req: &FileDownloadRequest) -> Result<bool, EngineError> {
    if let Some(sha256) = req.expected_digests.get(DigestAlgorithm::Sha256) {
        if let Some(embedded) = annex_sha256e_digest(&req.final_path) {
            if embedded == sha256 {
                return Ok(true);
            }
        }
    }
    if req.expected_digests.contains(DigestAlgorithm::DandiEtag) {
        let local = compute_etag_of_file(&req.final_path).await?;
        return Ok(Some(local.as_str()) == req.expected_digests.get(DigestAlgorithm::DandiEtag));
    }
    if let Some(md5) = req.expected_digests.get(DigestAlgorithm::Md5) {
        let local = compute_md5_of_file(&req.final_path).await?;
        return Ok(local == md5);
    }
    Ok(false)
}

async fn mtime_and_size_match(req: &FileDownloadRequest) -> Result<bool, EngineError> {
    let (Some(expected_mtime), Some(expected_size)) = (req.expected_mtime, req.expected_size)
    else {
        return Ok(false);
    };
    let meta = match tokio::fs::metadata(&req.final_path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if meta.len() != expected_size {
        return Ok(false);
    }
    let local_mtime = meta.modified()?;
    let local_secs = local_mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(local_secs == expected_mtime.timestamp() as u64)
}

/// Run one `FileDownloader` invocation to completion, calling `emit` for
/// every progress record and, on a verified digest, `digest_callback` with
/// `(algorithm name, value)`.
pub async fn download_file(
    req: &FileDownloadRequest,
    source: &dyn ByteSource,
    mkdir_lock: &AsyncMutex<()>,
    retry: &RetryConfig,
    emit: &mut dyn FnMut(ProgressEvent),
    mut digest_callback: Option<&mut dyn FnMut(&str, &str)>,
) -> Result<(), EngineError> {
    if tokio::fs::metadata(&req.final_path).await.is_ok() {
        match req.existence {
            ExistencePolicy::Error => {
                return Err(EngineError::AlreadyExists {
                    path: req.final_path.display().to_string(),
                });
            }
            ExistencePolicy::Skip => {
                emit(ProgressEvent::Status {
                    kind: StatusKind::Skipped,
                    message: Some("already exists".to_string()),
                });
                return Ok(());
            }
            ExistencePolicy::Overwrite => {}
            ExistencePolicy::OverwriteDifferent => {
                if locally_matches(req).await? {
                    emit(ProgressEvent::Status {
                        kind: StatusKind::Skipped,
                        message: Some("already exists".to_string()),
                    });
                    return Ok(());
                }
            }
            ExistencePolicy::Refresh => {
                if is_annex_sibling(&req.toplevel_path) {
                    return Err(EngineError::AnnexRefreshForbidden {
                        path: req.final_path.display().to_string(),
                    });
                }
                if mtime_and_size_match(req).await? {
                    emit(ProgressEvent::Status {
                        kind: StatusKind::Skipped,
                        message: Some("already exists".to_string()),
                    });
                    return Ok(());
                }
            }
        }
    }

    {
        let _guard = mkdir_lock.lock().await;
        if let Some(parent) = req.final_path.parent() {
            if tokio::fs::metadata(parent)
                .await
                .map(|m| !m.is_dir())
                .unwrap_or(false)
            {
                tokio::fs::remove_file(parent).await?;
            }
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let workspace = DownloadDirectory::open(&req.final_path).await?;
    let resumed = workspace.can_resume(&req.expected_digests).await?;
    if !resumed {
        workspace.reset().await?;
    }
    workspace.save_digests(&req.expected_digests).await?;

    let mut digest = if resumed {
        None
    } else {
        StreamingDigest::choose(&req.expected_digests, req.expected_size)
    };

    let mut size_emitted = false;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let offset = workspace.resume_offset().await?;

        if let Some(size) = req.expected_size {
            if !size_emitted {
                emit(ProgressEvent::Size(size));
                size_emitted = true;
            }
            if offset == size {
                break;
            }
        }

        emit(ProgressEvent::Status {
            kind: StatusKind::Downloading,
            message: None,
        });

        let result = pull(&workspace, source, offset, req.expected_size, &mut digest, emit).await;

        match result {
            Ok(()) => break,
            Err(e) if e.is_retryable_http() && attempt < retry.max_attempts => {
                let jitter = rand::thread_rng().gen_range(0.0..retry.backoff_max_secs);
                tokio::time::sleep(std::time::Duration::from_secs_f64(jitter)).await;
                continue;
            }
            Err(e) => {
                emit(ProgressEvent::Status {
                    kind: StatusKind::Error,
                    message: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }

    if let Some(digest) = digest.take() {
        let (algo, value) = digest.finalize()?;
        let expected = req.expected_digests.get(algo);
        if expected == Some(value.as_str()) {
            emit(ProgressEvent::Checksum {
                outcome: ChecksumOutcome::Ok,
                status: None,
                message: None,
            });
            if let Some(ref mut cb) = digest_callback {
                cb(algo.as_str(), &value);
            }
        } else {
            let message = format!(
                "checksum mismatch: expected {}, got {value}",
                expected.unwrap_or("<none>")
            );
            emit(ProgressEvent::Checksum {
                outcome: ChecksumOutcome::Differs,
                status: Some(StatusKind::Error),
                message: Some(message.clone()),
            });
            return Err(EngineError::ChecksumMismatch {
                expected: expected.unwrap_or("<none>").to_string(),
                actual: value,
            });
        }
    } else {
        emit(ProgressEvent::Checksum {
            outcome: ChecksumOutcome::Unknown,
            status: None,
            message: None,
        });
    }

    emit(ProgressEvent::Status {
        kind: StatusKind::SettingMtime,
        message: None,
    });
    let mtime_system = req.expected_mtime.map(|dt| {
        UNIX_EPOCH + std::time::Duration::from_secs(dt.timestamp().max(0) as u64)
    });
    workspace.publish(mtime_system).await?;

    emit(ProgressEvent::Status {
        kind: StatusKind::Done,
        message: None,
    });
    Ok(())
}

async fn pull(
    workspace: &DownloadDirectory,
    source: &dyn ByteSource,
    offset: u64,
    expected_size: Option<u64>,
    digest: &mut Option<StreamingDigest>,
    emit: &mut dyn FnMut(ProgressEvent),
) -> Result<(), EngineError> {
    let mut file = workspace.open_for_append().await?;
    let mut stream: ByteStream = source.open(offset);
    let mut downloaded = offset;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        if let Some(d) = digest.as_mut() {
            d.feed(downloaded, &chunk)?;
        }
        downloaded += chunk.len() as u64;
        let pct = expected_size
            .filter(|s| *s > 0)
            .map(|s| downloaded as f64 / s as f64 * 100.0)
            .unwrap_or(0.0);
        emit(ProgressEvent::Done {
            done: downloaded,
            pct,
        });
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    struct VecSource {
        data: Vec<u8>,
        flaky_remaining: std::sync::atomic::AtomicU32,
    }

    impl ByteSource for VecSource {
        fn open(&self, offset: u64) -> ByteStream {
            if self
                .flaky_remaining
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |n| if n > 0 { Some(n - 1) } else { None },
                )
                .is_ok()
            {
                return Box::pin(stream::once(async {
                    Err(EngineError::TransientHttp { status: 503 })
                }));
            }
            let rest = self.data[offset as usize..].to_vec();
            Box::pin(stream::iter(
                rest.chunks(16)
                    .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
                    .collect::<Vec<_>>(),
            ))
        }
    }

    fn base_request(dir: &std::path::Path, data: &[u8], digests: DigestMap) -> FileDownloadRequest {
        FileDownloadRequest {
            final_path: dir.join("out.bin"),
            toplevel_path: dir.to_path_buf(),
            expected_size: Some(data.len() as u64),
            expected_mtime: None,
            expected_digests: digests,
            existence: ExistencePolicy::Overwrite,
        }
    }

    #[tokio::test]
    async fn fresh_download_verifies_digest_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"hello world, this is a test payload".to_vec();
        let etag = super::super::multipart_etag::etag_of_bytes(&data).unwrap();
        let mut digests = DigestMap::new();
        digests.insert(DigestAlgorithm::DandiEtag, etag);
        let req = base_request(dir.path(), &data, digests);
        let source = VecSource {
            data: data.clone(),
            flaky_remaining: std::sync::atomic::AtomicU32::new(0),
        };
        let lock = AsyncMutex::new(());
        let mut events = Vec::new();
        let mut emit = |e: ProgressEvent| events.push(e);
        download_file(&req, &source, &lock, &RetryConfig::default(), &mut emit, None)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&req.final_path).await.unwrap(), data);
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Status { kind: StatusKind::Done, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Checksum { outcome: ChecksumOutcome::Ok, .. })));
    }

    #[tokio::test]
    async fn skip_policy_on_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"xyz".to_vec();
        tokio::fs::write(dir.path().join("out.bin"), b"already here")
            .await
            .unwrap();
        let mut req = base_request(dir.path(), &data, DigestMap::new());
        req.existence = ExistencePolicy::Skip;
        let source = VecSource {
            data,
            flaky_remaining: std::sync::atomic::AtomicU32::new(0),
        };
        let lock = AsyncMutex::new(());
        let mut events = Vec::new();
        let mut emit = |e: ProgressEvent| events.push(e);
        download_file(&req, &source, &lock, &RetryConfig::default(), &mut emit, None)
            .await
            .unwrap();
        assert_eq!(
            tokio::fs::read(dir.path().join("out.bin")).await.unwrap(),
            b"already here"
        );
        assert!(matches!(
            events[0],
            ProgressEvent::Status { kind: StatusKind::Skipped, .. }
        ));
    }

    #[tokio::test]
    async fn error_policy_fails_when_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("out.bin"), b"x").await.unwrap();
        let mut req = base_request(dir.path(), b"x", DigestMap::new());
        req.existence = ExistencePolicy::Error;
        let source = VecSource {
            data: b"x".to_vec(),
            flaky_remaining: std::sync::atomic::AtomicU32::new(0),
        };
        let lock = AsyncMutex::new(());
        let mut emit = |_: ProgressEvent| {};
        let result = download_file(&req, &source, &lock, &RetryConfig::default(), &mut emit, None).await;
        assert!(matches!(result, Err(EngineError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"retry-me-please".to_vec();
        let etag = super::super::multipart_etag::etag_of_bytes(&data).unwrap();
        let mut digests = DigestMap::new();
        digests.insert(DigestAlgorithm::DandiEtag, etag);
        let req = base_request(dir.path(), &data, digests);
        let source = VecSource {
            data: data.clone(),
            flaky_remaining: std::sync::atomic::AtomicU32::new(2),
        };
        let lock = AsyncMutex::new(());
        let mut emit = |_: ProgressEvent| {};
        download_file(&req, &source, &lock, &RetryConfig::default(), &mut emit, None)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&req.final_path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn checksum_mismatch_does_not_publish() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"bytes that will not match".to_vec();
        let mut digests = DigestMap::new();
        digests.insert(DigestAlgorithm::DandiEtag, "0".repeat(32) + "-1");
        let req = base_request(dir.path(), &data, digests);
        let source = VecSource {
            data,
            flaky_remaining: std::sync::atomic::AtomicU32::new(0),
        };
        let lock = AsyncMutex::new(());
        let mut emit = |_: ProgressEvent| {};
        let result = download_file(&req, &source, &lock, &RetryConfig::default(), &mut emit, None).await;
        assert!(matches!(result, Err(EngineError::ChecksumMismatch { .. })));
        assert!(tokio::fs::metadata(&req.final_path).await.is_err());
    }
}
