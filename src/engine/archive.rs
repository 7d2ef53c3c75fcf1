//! Archive client — the external collaborator interfaces the engine consumes
//! (spec.md §6). Everything else about the archive (URL parsing, dandiset
//! resolution, metadata validation) is explicitly out of scope; this module
//! only defines what the engine needs handed to it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::EngineError;

/// HTTP status codes treated as transient and worth retrying (spec.md §6, §9).
pub const RETRY_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// A byte stream as handed back by `open(offset)` (spec.md §4.4 inputs).
pub type ByteStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// The enumeration stream `list_assets` hands back (spec.md §5/§9's
/// "aggregation-while-iterating": a single producer feeding a bounded
/// channel, read without blocking the start of downloads). A failure while
/// enumerating surfaces as one `Err` item rather than aborting construction
/// of the stream itself, since enumeration may already be running on a
/// background worker by the time an error occurs.
pub type AssetStream = BoxStream<'static, Result<AssetRef, EngineError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    DandiEtag,
    Sha256,
    Md5,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::DandiEtag => "dandi-etag",
            DigestAlgorithm::Sha256 => "sha2-256",
            DigestAlgorithm::Md5 => "md5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dandi-etag" => Some(DigestAlgorithm::DandiEtag),
            "sha2-256" => Some(DigestAlgorithm::Sha256),
            "md5" => Some(DigestAlgorithm::Md5),
            _ => None,
        }
    }
}

/// Insertion-ordered `{algorithm -> value}` map (spec.md §3).
///
/// A plain `HashMap` would not let `FileDownloader` honor the "choose first
/// available algorithm" preference rule from the original `_download_file`,
/// so digests are kept in the order the archive client reported them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestMap(Vec<(DigestAlgorithm, String)>);

impl DigestMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, algo: DigestAlgorithm, value: impl Into<String>) -> &mut Self {
        if let Some(slot) = self.0.iter_mut().find(|(a, _)| *a == algo) {
            slot.1 = value.into();
        } else {
            self.0.push((algo, value.into()));
        }
        self
    }

    pub fn get(&self, algo: DigestAlgorithm) -> Option<&str> {
        self.0
            .iter()
            .find(|(a, _)| *a == algo)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, algo: DigestAlgorithm) -> bool {
        self.get(algo).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DigestAlgorithm, &str)> {
        self.0.iter().map(|(a, v)| (*a, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True iff the algorithms `self` and `other` both have values for are a
    /// non-empty set, and every one of those shared algorithms agrees on the
    /// value — the DownloadDirectory resume decision rule (spec.md §4.3),
    /// matching `matching_algs = self.digests.keys() & digests.keys(); if
    /// matching_algs and all(self.digests[alg] == digests[alg] for alg in
    /// matching_algs)` in the original.
    pub fn shares_matching_pair_with(&self, other: &DigestMap) -> bool {
        let mut shared = self.0.iter().filter(|(algo, _)| other.contains(*algo)).peekable();
        shared.peek().is_some()
            && shared.all(|(algo, value)| other.get(*algo) == Some(value.as_str()))
    }

    /// Serialize to the `{algorithm-name: value}` pairs stored in the
    /// on-disk checksum manifest (spec.md §4.3).
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(algo, v)| (algo.as_str().to_string(), v.clone()))
            .collect()
    }

    /// Rebuild from manifest pairs, silently dropping any algorithm name the
    /// running engine no longer recognizes.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> DigestMap {
        let mut map = DigestMap::new();
        for (name, value) in pairs {
            if let Some(algo) = DigestAlgorithm::parse(&name) {
                map.insert(algo, value);
            }
        }
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Blob,
    Zarr,
}

/// An immutable reference to a remote asset (spec.md §3).
#[derive(Debug, Clone)]
pub struct AssetRef {
    pub kind: AssetKind,
    /// Forward-slash, path relative to the dandiset root.
    pub path: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub digests: DigestMap,
}

/// One entry of a Zarr asset's remote file listing (spec.md §4.5, §6).
#[derive(Debug, Clone)]
pub struct ZarrEntry {
    /// Path relative to the Zarr asset's root, forward-slash.
    pub path: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub md5: String,
}

/// The interfaces the engine consumes from the archive API client
/// (spec.md §6). A concrete HTTP-backed implementation lives in
/// [`crate::engine::http_archive`].
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Enumerate the assets under the URL this client was constructed for.
    ///
    /// Returns a stream rather than a collected `Vec` (spec.md §5, §9): the
    /// Coordinator dispatches each asset as it arrives instead of waiting
    /// for enumeration to finish, so the first download can start behind a
    /// single item rather than behind the whole manifest. Implementations
    /// that must fetch a full listing up front (e.g. one JSON document)
    /// should still run that fetch on a background task and feed the
    /// results through a channel, rather than awaiting it inline here.
    async fn list_assets(&self) -> AssetStream;

    /// `open(offset) -> iterator<bytes>` for a BLOB asset: an HTTP GET with
    /// `Range: bytes=offset-`.
    fn open_blob(&self, asset: &AssetRef, offset: u64) -> ByteStream;

    /// Enumerate a Zarr asset's remote entries plus the aggregate checksum.
    async fn list_zarr_entries(
        &self,
        asset: &AssetRef,
    ) -> Result<(Vec<ZarrEntry>, String), EngineError>;

    /// `open(offset) -> iterator<bytes>` for one Zarr entry.
    fn open_zarr_entry(&self, asset: &AssetRef, entry: &ZarrEntry, offset: u64) -> ByteStream;
}
