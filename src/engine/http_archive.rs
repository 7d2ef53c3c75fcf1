//! A reference `ArchiveClient` (spec.md §6's "archive API client" collaborator).
//!
//! This is intentionally thin: URL parsing, dandiset/version resolution, and
//! the metadata-validation pipeline are out of scope (spec.md §1). What's here
//! is just enough reqwest plumbing — Range GETs and a small JSON asset-list
//! manifest — to drive the engine against a real or mocked HTTP origin,
//! grounded in the teacher's `infra::network::http_adapter` / `shared::network::http`
//! reqwest-client-building pattern.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::header::RANGE;
use reqwest::{Client, Proxy, Url};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

use super::archive::{
    ArchiveClient, AssetKind, AssetRef, AssetStream, ByteStream, DigestAlgorithm, DigestMap, ZarrEntry,
    RETRY_STATUSES,
};
use super::config::HttpConfig;
use crate::error::EngineError;

#[derive(Debug, Deserialize)]
struct AssetManifestEntry {
    kind: String,
    path: String,
    size: u64,
    mtime: Option<DateTime<Utc>>,
    #[serde(default)]
    digests: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AssetManifest {
    assets: Vec<AssetManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ZarrEntryManifestItem {
    path: String,
    size: u64,
    mtime: Option<DateTime<Utc>>,
    md5: String,
}

#[derive(Debug, Deserialize)]
struct ZarrManifest {
    checksum: String,
    entries: Vec<ZarrEntryManifestItem>,
}

/// A `reqwest`-backed [`ArchiveClient`] rooted at `base_url`.
///
/// Expects `base_url.join("assets.json")` to serve an [`AssetManifest`], and
/// `base_url.join("<asset path>.zarr-manifest.json")` to serve a
/// [`ZarrManifest`] for each Zarr asset.
pub struct HttpArchiveClient {
    client: Client,
    base_url: Url,
}

impl HttpArchiveClient {
    #[instrument(name = "new_http_archive_client", fields(base_url = %base_url))]
    pub fn new(base_url: Url, http: &HttpConfig) -> Result<Self, EngineError> {
        let mut builder = Client::builder().timeout(http.timeout());
        if let Some(max_redirects) = http.max_redirects {
            builder = builder.redirect(reqwest::redirect::Policy::limited(max_redirects));
        }
        if let Some(proxy_url) = &http.proxy_url {
            builder = builder.proxy(Proxy::all(proxy_url).map_err(|e| EngineError::Other {
                message: format!("invalid proxy url: {e}"),
            })?);
        }
        let client = builder.build().map_err(EngineError::from)?;
        Ok(Self { client, base_url })
    }

    fn resolve(&self, relative: &str) -> Result<Url, EngineError> {
        resolve(&self.base_url, relative)
    }

    fn classify_status(status: u16) -> EngineError {
        if status == 400 || RETRY_STATUSES.contains(&status) {
            EngineError::TransientHttp { status }
        } else {
            EngineError::PermanentHttp {
                status,
                message: format!("unexpected status {status}"),
            }
        }
    }

    async fn range_stream(client: Client, url: Url, offset: u64) -> ByteStream {
        let request = client.get(url).header(RANGE, format!("bytes={offset}-"));
        match request.send().await {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 206 => {
                Box::pin(resp.bytes_stream().map(|r| r.map_err(EngineError::from)))
            }
            Ok(resp) => {
                let status = resp.status().as_u16();
                Box::pin(stream::once(async move { Err(Self::classify_status(status)) }))
            }
            Err(e) => Box::pin(stream::once(async move { Err(EngineError::from(e)) })),
        }
    }

    fn boxed_range_stream(&self, url: Url, offset: u64) -> ByteStream {
        let client = self.client.clone();
        Box::pin(stream::once(async move { Self::range_stream(client, url, offset).await }).flatten())
    }
}

fn resolve(base_url: &Url, relative: &str) -> Result<Url, EngineError> {
    base_url.join(relative).map_err(|e| EngineError::Other {
        message: format!("bad asset path {relative:?}: {e}"),
    })
}

fn parse_manifest_entry(entry: AssetManifestEntry) -> Result<AssetRef, EngineError> {
    let kind = match entry.kind.as_str() {
        "blob" => AssetKind::Blob,
        "zarr" => AssetKind::Zarr,
        other => {
            return Err(EngineError::Other {
                message: format!("unknown asset kind {other:?} for {}", entry.path),
            })
        }
    };
    Ok(AssetRef {
        kind,
        path: entry.path,
        size: entry.size,
        mtime: entry.mtime,
        digests: to_digest_map(entry.digests),
    })
}

/// Fetch and parse the asset manifest. Run on a background task by
/// `list_assets` rather than awaited inline, so the Coordinator's dispatch
/// loop never blocks behind it.
async fn fetch_asset_manifest(client: Client, base_url: Url) -> Result<Vec<AssetRef>, EngineError> {
    let url = resolve(&base_url, "assets.json")?;
    debug!(url = %url, "fetching asset manifest");
    let manifest: AssetManifest = client
        .get(url)
        .send()
        .await
        .map_err(EngineError::from)?
        .error_for_status()
        .map_err(EngineError::from)?
        .json()
        .await
        .map_err(EngineError::from)?;

    manifest.assets.into_iter().map(parse_manifest_entry).collect()
}

fn to_digest_map(digests: HashMap<String, String>) -> DigestMap {
    let mut map = DigestMap::new();
    for (name, value) in digests {
        if let Some(algo) = DigestAlgorithm::parse(&name) {
            map.insert(algo, value);
        } else {
            warn!(algorithm = %name, "unrecognized digest algorithm in asset manifest");
        }
    }
    map
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    #[instrument(name = "http_archive_list_assets", skip(self))]
    async fn list_assets(&self) -> AssetStream {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            match fetch_asset_manifest(client, base_url).await {
                Ok(assets) => {
                    for asset in assets {
                        if tx.send(Ok(asset)).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    fn open_blob(&self, asset: &AssetRef, offset: u64) -> ByteStream {
        match self.resolve(&asset.path) {
            Ok(url) => self.boxed_range_stream(url, offset),
            Err(e) => Box::pin(stream::once(async move { Err(e) })),
        }
    }

    #[instrument(name = "http_archive_list_zarr_entries", skip(self), fields(asset = %asset.path))]
    async fn list_zarr_entries(
        &self,
        asset: &AssetRef,
    ) -> Result<(Vec<ZarrEntry>, String), EngineError> {
        let url = self.resolve(&format!("{}.zarr-manifest.json", asset.path))?;
        let manifest: ZarrManifest = self
            .client
            .get(url)
            .send()
            .await
            .map_err(EngineError::from)?
            .error_for_status()
            .map_err(EngineError::from)?
            .json()
            .await
            .map_err(EngineError::from)?;

        let entries = manifest
            .entries
            .into_iter()
            .map(|e| ZarrEntry {
                path: e.path,
                size: e.size,
                mtime: e.mtime,
                md5: e.md5,
            })
            .collect();
        Ok((entries, manifest.checksum))
    }

    fn open_zarr_entry(&self, asset: &AssetRef, entry: &ZarrEntry, offset: u64) -> ByteStream {
        match self.resolve(&format!("{}/{}", asset.path, entry.path)) {
            Ok(url) => self.boxed_range_stream(url, offset),
            Err(e) => Box::pin(stream::once(async move { Err(e) })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_retry_set() {
        assert!(matches!(
            HttpArchiveClient::classify_status(503),
            EngineError::TransientHttp { status: 503 }
        ));
        assert!(matches!(
            HttpArchiveClient::classify_status(400),
            EngineError::TransientHttp { status: 400 }
        ));
        assert!(matches!(
            HttpArchiveClient::classify_status(404),
            EngineError::PermanentHttp { status: 404, .. }
        ));
    }

    #[test]
    fn digest_map_drops_unknown_algorithms() {
        let mut raw = HashMap::new();
        raw.insert("dandi-etag".to_string(), "abc-1".to_string());
        raw.insert("crc32".to_string(), "deadbeef".to_string());
        let map = to_digest_map(raw);
        assert!(map.contains(DigestAlgorithm::DandiEtag));
        assert_eq!(map.iter().count(), 1);
    }
}
