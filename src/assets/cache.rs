//! Durable bucket for the engine runtime and binary
//!
//! The bucket is a directory; each entry is a file named after the SHA-256 of
//! its URL. Both entries are always read and reported as a pair so the engine
//! never sees a runtime from one release and a binary from another.

use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::AssetError;
use crate::config::Config;
use crate::controller::AssetRefs;
use crate::objects::{Blob, ObjectStore, ObjectUrl};

const STORAGE_API: &str = "CacheStorage";
const SCRIPT_MIME: &str = "text/javascript";
const BINARY_MIME: &str = "application/wasm";

/// Remote locations of the two engine assets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetUrls {
    pub script: String,
    pub binary: String,
}

impl AssetUrls {
    pub fn from_config(config: &Config) -> Self {
        Self {
            script: config.assets.script_url.clone(),
            binary: config.assets.binary_url.clone(),
        }
    }
}

/// Local references to both cached assets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRefs {
    pub script_ref: ObjectUrl,
    pub binary_ref: ObjectUrl,
}

impl From<LocalRefs> for AssetRefs {
    fn from(refs: LocalRefs) -> Self {
        AssetRefs::new(refs.script_ref, refs.binary_ref)
    }
}

/// Fetches, stores and hands out the engine assets
#[derive(Clone)]
pub struct AssetCache {
    client: Client,
    urls: AssetUrls,
    /// Bucket directory; `None` when the platform offers no cache location
    bucket: Option<PathBuf>,
    store: ObjectStore,
}

impl AssetCache {
    /// Create a cache using the configured bucket location
    pub fn new(config: &Config, store: ObjectStore) -> Self {
        let bucket = config
            .cache_root()
            .map(|root| root.join(&config.assets.bucket));
        Self::with_bucket(Client::new(), AssetUrls::from_config(config), bucket, store)
    }

    pub fn with_bucket(
        client: Client,
        urls: AssetUrls,
        bucket: Option<PathBuf>,
        store: ObjectStore,
    ) -> Self {
        Self {
            client,
            urls,
            bucket,
            store,
        }
    }

    pub fn urls(&self) -> &AssetUrls {
        &self.urls
    }

    fn entry_path(bucket: &Path, url: &str) -> PathBuf {
        bucket.join(hex::encode(Sha256::digest(url.as_bytes())))
    }

    /// Whether both assets are present. Never fails.
    pub async fn is_cached(&self) -> bool {
        let Some(bucket) = &self.bucket else {
            return false;
        };
        for url in [&self.urls.script, &self.urls.binary] {
            let present = tokio::fs::try_exists(Self::entry_path(bucket, url))
                .await
                .unwrap_or(false);
            if !present {
                return false;
            }
        }
        true
    }

    /// Download both assets, bypassing intermediate caches, and store them
    pub async fn warm(&self) -> Result<(), AssetError> {
        let bucket = self
            .bucket
            .as_ref()
            .ok_or(AssetError::StorageUnavailable(STORAGE_API))?;

        info!("Warming asset cache in {:?}", bucket);

        // Fetch both before storing either, so a failed download leaves the
        // bucket untouched
        let (script, binary) = futures::try_join!(
            fetch_fresh(&self.client, &self.urls.script),
            fetch_fresh(&self.client, &self.urls.binary),
        )?;

        tokio::fs::create_dir_all(bucket).await?;
        store_entry(bucket, &self.urls.script, &script).await?;
        store_entry(bucket, &self.urls.binary, &binary).await?;

        info!(
            "Cached engine assets (runtime {:.2} KB, binary {:.2} MB)",
            script.len() as f64 / 1024.0,
            binary.len() as f64 / (1024.0 * 1024.0)
        );
        Ok(())
    }

    /// Delete the whole bucket. Silently does nothing without storage.
    pub async fn clear(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        match tokio::fs::remove_dir_all(bucket).await {
            Ok(()) => info!("Cleared asset cache {:?}", bucket),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clear asset cache {:?}: {}", bucket, e),
        }
    }

    /// Mint local references to both cached assets, or `None` if either is
    /// missing
    pub async fn local_refs(&self) -> Option<LocalRefs> {
        let bucket = self.bucket.as_ref()?;

        let script = read_entry(bucket, &self.urls.script).await?;
        let binary = read_entry(bucket, &self.urls.binary).await?;

        Some(LocalRefs {
            script_ref: self.store.create(Blob::new(script, SCRIPT_MIME)),
            binary_ref: self.store.create(Blob::new(binary, BINARY_MIME)),
        })
    }
}

/// Fetch both assets straight from their origin and mint local references,
/// without touching the bucket
pub async fn fetch_remote_refs(
    client: &Client,
    urls: &AssetUrls,
    store: &ObjectStore,
) -> Result<LocalRefs, AssetError> {
    let (script, binary) = futures::try_join!(
        fetch_fresh(client, &urls.script),
        fetch_fresh(client, &urls.binary),
    )?;
    Ok(LocalRefs {
        script_ref: store.create(Blob::new(script, SCRIPT_MIME)),
        binary_ref: store.create(Blob::new(binary, BINARY_MIME)),
    })
}

async fn fetch_fresh(client: &Client, url: &str) -> Result<Vec<u8>, AssetError> {
    debug!("Fetching {}", url);

    let response = client
        .get(url)
        .header(CACHE_CONTROL, "no-cache")
        .header(PRAGMA, "no-cache")
        .send()
        .await
        .map_err(|source| AssetError::Request {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(AssetError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|source| AssetError::Request {
            url: url.to_string(),
            source,
        })?;
    Ok(bytes.to_vec())
}

/// Write via a temporary file so a reader never sees a torn entry
async fn store_entry(bucket: &Path, url: &str, bytes: &[u8]) -> Result<(), AssetError> {
    let path = AssetCache::entry_path(bucket, url);
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!("Stored {} as {:?}", url, path);
    Ok(())
}

async fn read_entry(bucket: &Path, url: &str) -> Option<Vec<u8>> {
    match tokio::fs::read(AssetCache::entry_path(bucket, url)).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read cached asset {}: {}", url, e);
            }
            None
        }
    }
}
