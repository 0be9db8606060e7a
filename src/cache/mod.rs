pub mod blob;
pub mod inflight;
pub mod key;
pub mod manifest;
pub mod memory;
pub mod stats;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use humansize::{format_size, BINARY};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use blob::FileBlobStore;
use inflight::InflightManager;
use key::{digest_from_path, parse_path, PathKind};
use manifest::FileManifestStore;
use memory::LruDescriptorCache;
use stats::CacheStatistics;

pub use key::is_cacheable;

#[derive(Debug)]
pub enum CacheError {
    NotFound,
    Expired,
    DigestMismatch { expected: String, actual: String },
    Io(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "not found in cache"),
            CacheError::Expired => write!(f, "cache entry expired"),
            CacheError::DigestMismatch { expected, actual } => {
                write!(f, "digest mismatch: expected {expected}, got {actual}")
            }
            CacheError::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

/// Immutable identity of a piece of content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub media_type: String,
}

/// One cached response: descriptor plus the captured headers and status,
/// with the body either inline (small objects) or on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub descriptor: Descriptor,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_path: Option<PathBuf>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => STANDARD.encode(bytes).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_size: u64,
    pub manifest_ttl: Duration,
    pub blob_ttl: Duration,
    pub cleanup_interval: Duration,
    pub debug: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cache"),
            max_size: 10 * 1024 * 1024 * 1024,
            manifest_ttl: Duration::from_secs(24 * 60 * 60),
            blob_ttl: Duration::from_secs(365 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(30 * 60),
            debug: false,
        }
    }
}

/// Unified entry point over the two disk stores, the descriptor LRU, the
/// inflight coalescer and the statistics counters. The disk is the durable
/// source; the memory layers are regenerable projections of it.
pub struct CacheManager {
    config: CacheConfig,
    blobs: FileBlobStore,
    manifests: FileManifestStore,
    descriptors: LruDescriptorCache,
    inflight: InflightManager,
    stats: CacheStatistics,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    /// Creates the on-disk layout and starts the background maintenance
    /// loop plus the startup index rebuild. Directory creation failure is
    /// the only fatal cache error.
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        for sub in ["", "blobs", "manifests", "tmp"] {
            let dir = config.dir.join(sub);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        }

        let manager = Arc::new(Self {
            blobs: FileBlobStore::new(config.dir.join("blobs"), config.blob_ttl),
            manifests: FileManifestStore::new(
                config.dir.join("manifests"),
                config.manifest_ttl,
                config.blob_ttl,
            ),
            descriptors: LruDescriptorCache::new(memory::DEFAULT_CAPACITY),
            inflight: InflightManager::new(),
            stats: CacheStatistics::default(),
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            config,
        });

        let cleanup = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.cleanup_loop().await })
        };
        let index_load = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.load_index().await })
        };
        manager
            .background
            .lock()
            .expect("background task lock")
            .extend([cleanup, index_load]);

        Ok(manager)
    }

    pub fn inflight(&self) -> &InflightManager {
        &self.inflight
    }

    pub fn stats(&self) -> &CacheStatistics {
        &self.stats
    }

    /// Unified read keyed by `host + path`. Manifest keys return the full
    /// entry; blob keys return a metadata-only entry (stream the body via
    /// `get_blob_reader`).
    pub async fn get(&self, cache_key: &str) -> Option<CacheEntry> {
        match parse_path(cache_key)? {
            (PathKind::Manifest, repo, reference) => {
                self.get_manifest(&repo, &reference).await.ok()
            }
            (PathKind::Blob, _, _) => {
                let digest = digest_from_path(cache_key)?;
                match self.blobs.stat(digest).await {
                    Ok(descriptor) => {
                        self.stats.blob_hits.fetch_add(1, Ordering::Relaxed);
                        Some(blob_entry(descriptor))
                    }
                    Err(_) => {
                        self.stats.blob_misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
        }
    }

    /// Blob read with a streaming body. The descriptor cache fronts the
    /// store; a descriptor whose file has vanished is evicted and the
    /// lookup degrades to the disk path.
    pub async fn get_blob_reader(
        &self,
        cache_key: &str,
    ) -> Option<(CacheEntry, tokio::fs::File)> {
        let digest = digest_from_path(cache_key)?;

        if let Some(descriptor) = self.descriptors.get(digest) {
            match self.blobs.open(digest).await {
                Ok(file) => {
                    self.stats.blob_hits.fetch_add(1, Ordering::Relaxed);
                    return Some((blob_entry(descriptor), file));
                }
                Err(_) => self.descriptors.remove(digest),
            }
        }

        if let Ok(descriptor) = self.blobs.stat(digest).await {
            if let Ok(file) = self.blobs.open(digest).await {
                self.stats.blob_hits.fetch_add(1, Ordering::Relaxed);
                self.descriptors.set(digest, descriptor.clone());
                return Some((blob_entry(descriptor), file));
            }
        }

        self.stats.blob_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn get_manifest(&self, repo: &str, reference: &str) -> Result<CacheEntry, CacheError> {
        match self.manifests.get(repo, reference).await {
            Ok(entry) => {
                self.stats.manifest_hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry)
            }
            Err(error) => {
                self.stats.manifest_misses.fetch_add(1, Ordering::Relaxed);
                Err(error)
            }
        }
    }

    /// Unified write keyed by `host + path`; dispatches to the manifest or
    /// blob store and applies the tag/digest TTL policy there.
    pub async fn put(&self, cache_key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        match parse_path(cache_key) {
            Some((PathKind::Manifest, repo, reference)) => {
                let data = entry.data.clone().unwrap_or_default();
                self.put_manifest(&repo, &reference, data, entry.headers, entry.status_code)
                    .await
            }
            Some((PathKind::Blob, _, _)) => {
                let Some(digest) = digest_from_path(cache_key) else {
                    return Ok(());
                };
                match entry.data {
                    Some(data) if !data.is_empty() => {
                        self.put_blob(digest, &data, &entry.headers).await
                    }
                    _ => {
                        // metadata-only update
                        self.descriptors.set(digest, entry.descriptor);
                        Ok(())
                    }
                }
            }
            None => Ok(()),
        }
    }

    pub async fn put_manifest(
        &self,
        repo: &str,
        reference: &str,
        data: Vec<u8>,
        headers: HashMap<String, Vec<String>>,
        status_code: u16,
    ) -> Result<(), CacheError> {
        let digest = format!("sha256:{:x}", Sha256::digest(&data));
        let size = data.len() as u64;
        let now = Utc::now();

        let entry = CacheEntry {
            descriptor: Descriptor {
                digest,
                size,
                media_type: first_header(&headers, "Content-Type").unwrap_or_default(),
            },
            headers,
            status_code,
            data: Some(data),
            body_path: None,
            cached_at: now,
            // restamped by the store from the reference kind
            expires_at: now,
        };

        self.manifests.put(repo, reference, entry).await?;
        self.stats.manifest_count.fetch_add(1, Ordering::Relaxed);
        self.stats.total_size.fetch_add(size as i64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn put_blob(
        &self,
        digest: &str,
        data: &[u8],
        headers: &HashMap<String, Vec<String>>,
    ) -> Result<(), CacheError> {
        let media_type = first_header(headers, "Content-Type").unwrap_or_default();
        let written = self.blobs.put(digest, data, &media_type).await?;

        self.descriptors.set(
            digest,
            Descriptor {
                digest: digest.to_string(),
                size: written,
                media_type,
            },
        );
        self.stats.blob_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_size
            .fetch_add(written as i64, Ordering::Relaxed);
        Ok(())
    }

    async fn cleanup_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => self.cleanup().await,
            }
        }
    }

    /// One maintenance pass: manifest TTL sweep, blob TTL + size-cap sweep,
    /// counter refresh.
    pub async fn cleanup(&self) {
        let (manifests_removed, manifest_count, manifest_size) = self.manifests.cleanup().await;
        let (blobs_removed, blob_count, blob_size) =
            self.blobs.cleanup(self.config.max_size).await;

        self.stats.manifest_count.store(manifest_count as i64, Ordering::Relaxed);
        self.stats.blob_count.store(blob_count as i64, Ordering::Relaxed);
        self.stats
            .total_size
            .store((manifest_size + blob_size) as i64, Ordering::Relaxed);
        self.stats.record_cleanup(Utc::now());

        let removed = manifests_removed + blobs_removed;
        if removed > 0 {
            debug!("cache cleanup removed {removed} expired items");
        }
    }

    /// Startup index rebuild from the on-disk tree. Runs on a background
    /// task; the hit rate climbs as entries are indexed.
    pub async fn load_index(&self) {
        debug!("loading cache index from {}", self.config.dir.display());

        let (blob_count, blob_size) = self.blobs.load_index().await;
        let (manifest_count, manifest_size) = self.manifests.load_index().await;

        self.stats.blob_count.store(blob_count, Ordering::Relaxed);
        self.stats.manifest_count.store(manifest_count, Ordering::Relaxed);
        self.stats
            .total_size
            .store(blob_size + manifest_size, Ordering::Relaxed);

        debug!(
            "loaded cache index: {blob_count} blobs, {manifest_count} manifests, {} total",
            format_size((blob_size + manifest_size).max(0) as u64, BINARY)
        );
    }

    pub fn stats_snapshot(&self) -> Value {
        let mut snapshot = self.stats.snapshot(self.inflight.deduplicated());
        snapshot["inflight"] = self.inflight.stats();
        snapshot["descriptors"] = self.descriptors.stats();
        snapshot
    }

    /// Stops the maintenance loop and waits for background tasks.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut background = self.background.lock().expect("background task lock");
            background.drain(..).collect()
        };
        for task in tasks {
            if let Err(error) = task.await {
                if !error.is_cancelled() {
                    warn!("cache background task failed: {error}");
                }
            }
        }
    }
}

/// Standard headers for a blob served from cache. Upstream media types are
/// preserved; absent ones fall back to `application/octet-stream`.
fn blob_entry(descriptor: Descriptor) -> CacheEntry {
    let mut headers = HashMap::new();
    headers.insert(
        "Content-Length".to_string(),
        vec![descriptor.size.to_string()],
    );
    let content_type = if descriptor.media_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        descriptor.media_type.clone()
    };
    headers.insert("Content-Type".to_string(), vec![content_type]);
    headers.insert(
        "Docker-Content-Digest".to_string(),
        vec![descriptor.digest.clone()],
    );

    let now = Utc::now();
    CacheEntry {
        descriptor,
        headers,
        status_code: 200,
        data: None,
        body_path: None,
        cached_at: now,
        expires_at: now,
    }
}

fn first_header(headers: &HashMap<String, Vec<String>>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .cloned()
}
