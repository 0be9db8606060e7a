use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

use super::{expiry, CacheError, Descriptor};

const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Sidecar metadata written next to every blob file. The data file and the
/// sidecar form an atomic unit: created together, deleted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub media_type: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub file_path: PathBuf,
}

impl BlobMeta {
    fn descriptor(&self) -> Descriptor {
        Descriptor {
            digest: self.digest.clone(),
            size: self.size,
            media_type: self.media_type.clone(),
        }
    }
}

/// Content-addressed blob store: `<root>/<hex[0:2]>/<hex[2:4]>/<hex>` plus a
/// `.meta` sidecar, with an in-memory index rebuilt lazily from the
/// sidecars. The disk is authoritative; the index is a projection.
pub struct FileBlobStore {
    dir: PathBuf,
    ttl: Duration,
    index: RwLock<HashMap<String, BlobMeta>>,
}

impl FileBlobStore {
    pub fn new(dir: PathBuf, ttl: Duration) -> Self {
        Self {
            dir,
            ttl,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Checks whether a live blob exists, consulting the index first and
    /// falling back to the sidecar. Expired or corrupt pairs are removed on
    /// the way (self-healing).
    pub async fn stat(&self, digest: &str) -> Result<Descriptor, CacheError> {
        {
            let index = self.index.read().await;
            if let Some(meta) = index.get(digest) {
                if Utc::now() < meta.expires_at {
                    return Ok(meta.descriptor());
                }
            }
        }

        let path = self.blob_path(digest);
        let meta_path = sidecar_path(&path);

        let meta_bytes = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(_) => {
                self.index.write().await.remove(digest);
                return Err(CacheError::NotFound);
            }
        };

        let meta: BlobMeta = match serde_json::from_slice(&meta_bytes) {
            Ok(meta) => meta,
            Err(error) => {
                debug!("removing unreadable blob sidecar {}: {error}", meta_path.display());
                remove_pair(&path, &meta_path).await;
                self.index.write().await.remove(digest);
                return Err(CacheError::NotFound);
            }
        };

        if Utc::now() > meta.expires_at {
            remove_pair(&path, &meta_path).await;
            self.index.write().await.remove(digest);
            return Err(CacheError::Expired);
        }

        let descriptor = meta.descriptor();
        self.index.write().await.insert(digest.to_string(), meta);
        Ok(descriptor)
    }

    /// Opens the blob data file for streaming after a successful stat.
    pub async fn open(&self, digest: &str) -> Result<tokio::fs::File, CacheError> {
        self.stat(digest).await?;

        tokio::fs::File::open(self.blob_path(digest))
            .await
            .map_err(|_| CacheError::NotFound)
    }

    /// Streams `content` into the store, verifying its SHA-256 against the
    /// claimed digest. The write goes through a uniquely named temp file in
    /// the target directory and is renamed into place only after the digest
    /// checks out; a mismatch leaves no artifact behind.
    pub async fn put(
        &self,
        digest: &str,
        mut content: impl AsyncRead + Unpin,
        media_type: &str,
    ) -> Result<u64, CacheError> {
        let path = self.blob_path(digest);
        let dir = path.parent().expect("sharded blob path has a parent");
        tokio::fs::create_dir_all(dir).await?;

        let tmp_path = dir.join(format!("blob-{}.tmp", uuid::Uuid::new_v4()));
        let file = tokio::fs::File::create(&tmp_path).await?;
        let mut writer = tokio::io::BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; WRITE_BUFFER_SIZE];
        let mut written: u64 = 0;

        loop {
            let read = match content.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(error) => {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(error.into());
                }
            };
            hasher.update(&buffer[..read]);
            if let Err(error) = writer.write_all(&buffer[..read]).await {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(error.into());
            }
            written += read as u64;
        }

        if let Err(error) = writer.flush().await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(error.into());
        }
        drop(writer);

        let actual = format!("sha256:{:x}", hasher.finalize());
        if !digest.is_empty() && digest != actual {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(CacheError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }

        if tokio::fs::rename(&tmp_path, &path).await.is_err() {
            // rename can fail across devices; fall back to copy + remove
            if let Err(error) = tokio::fs::copy(&tmp_path, &path).await {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(error.into());
            }
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }

        let now = Utc::now();
        let meta = BlobMeta {
            digest: digest.to_string(),
            size: written,
            media_type: media_type.to_string(),
            cached_at: now,
            expires_at: expiry(now, self.ttl),
            file_path: path.clone(),
        };

        let meta_bytes = serde_json::to_vec(&meta).expect("blob metadata serializes");
        if let Err(error) = tokio::fs::write(sidecar_path(&path), meta_bytes).await {
            // the data file is in place; a missing sidecar just means the
            // entry is invisible until rewritten
            warn!("failed to save blob metadata for {digest}: {error}");
        }

        self.index.write().await.insert(digest.to_string(), meta);
        Ok(written)
    }

    pub async fn delete(&self, digest: &str) {
        self.index.write().await.remove(digest);
        let path = self.blob_path(digest);
        remove_pair(&path, &sidecar_path(&path)).await;
    }

    /// TTL sweep followed by size-capped eviction. Eviction beyond TTL uses
    /// index iteration order, which meets the cap without being true LRU.
    /// Returns (removed entries, remaining count, remaining size).
    pub async fn cleanup(&self, max_size: u64) -> (usize, usize, u64) {
        let now = Utc::now();
        let mut to_delete = Vec::new();
        let mut remaining_size: u64 = 0;

        {
            let index = self.index.read().await;
            for (digest, meta) in index.iter() {
                if now > meta.expires_at {
                    to_delete.push(digest.clone());
                } else {
                    remaining_size += meta.size;
                }
            }
        }

        if remaining_size > max_size {
            let index = self.index.read().await;
            for (digest, meta) in index.iter() {
                if remaining_size <= max_size {
                    break;
                }
                if to_delete.contains(digest) {
                    continue;
                }
                remaining_size -= meta.size;
                to_delete.push(digest.clone());
            }
        }

        for digest in &to_delete {
            self.delete(digest).await;
        }

        let remaining_count = self.index.read().await.len();
        (to_delete.len(), remaining_count, remaining_size)
    }

    /// Rebuilds the index from the on-disk tree, dropping expired pairs.
    /// Returns (entry count, aggregate size).
    pub async fn load_index(&self) -> (i64, i64) {
        let mut count: i64 = 0;
        let mut total_size: i64 = 0;
        let mut stack = vec![self.dir.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                    continue;
                }

                let Ok(meta_bytes) = tokio::fs::read(&path).await else {
                    continue;
                };
                let Ok(meta) = serde_json::from_slice::<BlobMeta>(&meta_bytes) else {
                    continue;
                };

                let data_path = path.with_extension("");
                if Utc::now() > meta.expires_at {
                    remove_pair(&data_path, &path).await;
                    continue;
                }

                count += 1;
                total_size += meta.size as i64;
                self.index
                    .write()
                    .await
                    .insert(meta.digest.clone(), meta);
            }
        }

        (count, total_size)
    }

    /// Two-level sharding keeps individual directories small.
    fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        if hex.len() < 4 {
            return self.dir.join(hex);
        }
        self.dir.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }
}

fn sidecar_path(data_path: &Path) -> PathBuf {
    let mut os_string = data_path.as_os_str().to_os_string();
    os_string.push(".meta");
    PathBuf::from(os_string)
}

async fn remove_pair(data_path: &Path, meta_path: &Path) {
    let _ = tokio::fs::remove_file(data_path).await;
    let _ = tokio::fs::remove_file(meta_path).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(bytes: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn put_then_stat_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_secs(3600));

        let body = b"layer bytes".to_vec();
        let digest = digest_of(&body);

        let written = store
            .put(&digest, body.as_slice(), "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(written, body.len() as u64);

        let descriptor = store.stat(&digest).await.unwrap();
        assert_eq!(descriptor.digest, digest);
        assert_eq!(descriptor.size, body.len() as u64);
        assert_eq!(descriptor.media_type, "application/octet-stream");

        let mut file = store.open(&digest).await.unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, body);
    }

    #[tokio::test]
    async fn files_land_in_sharded_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_secs(3600));

        let body = b"shard me".to_vec();
        let digest = digest_of(&body);
        store.put(&digest, body.as_slice(), "").await.unwrap();

        let hex = digest.strip_prefix("sha256:").unwrap();
        let expected = dir.path().join(&hex[0..2]).join(&hex[2..4]).join(hex);
        assert!(expected.exists());
        assert!(sidecar_path(&expected).exists());
    }

    #[tokio::test]
    async fn digest_mismatch_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_secs(3600));

        let claimed = digest_of(b"what upstream claimed");
        let result = store.put(&claimed, &b"different bytes"[..], "").await;

        match result {
            Err(CacheError::DigestMismatch { expected, .. }) => assert_eq!(expected, claimed),
            other => panic!("expected digest mismatch, got {other:?}"),
        }

        assert!(store.stat(&claimed).await.is_err());
        // neither data nor temp files survive
        let mut walker = vec![dir.path().to_path_buf()];
        while let Some(d) = walker.pop() {
            let mut entries = tokio::fs::read_dir(&d).await.unwrap();
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.unwrap().is_dir() {
                    walker.push(entry.path());
                } else {
                    panic!("unexpected file left behind: {:?}", entry.path());
                }
            }
        }
    }

    #[tokio::test]
    async fn expired_blob_is_removed_on_stat() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_millis(0));

        let body = b"short lived".to_vec();
        let digest = digest_of(&body);
        store.put(&digest, body.as_slice(), "").await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            store.stat(&digest).await,
            Err(CacheError::Expired) | Err(CacheError::NotFound)
        ));

        let hex = digest.strip_prefix("sha256:").unwrap();
        assert!(!dir.path().join(&hex[0..2]).join(&hex[2..4]).join(hex).exists());
    }

    #[tokio::test]
    async fn corrupt_sidecar_is_self_healed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_secs(3600));

        let body = b"data".to_vec();
        let digest = digest_of(&body);
        store.put(&digest, body.as_slice(), "").await.unwrap();

        let hex = digest.strip_prefix("sha256:").unwrap();
        let data_path = dir.path().join(&hex[0..2]).join(&hex[2..4]).join(hex);
        tokio::fs::write(sidecar_path(&data_path), b"{not json")
            .await
            .unwrap();

        // fresh store so the poisoned sidecar is actually read
        let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_secs(3600));
        assert!(matches!(store.stat(&digest).await, Err(CacheError::NotFound)));
        assert!(!data_path.exists());
    }

    #[tokio::test]
    async fn delete_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_secs(3600));

        let body = b"doomed".to_vec();
        let digest = digest_of(&body);
        store.put(&digest, body.as_slice(), "").await.unwrap();
        store.delete(&digest).await;

        assert!(matches!(store.stat(&digest).await, Err(CacheError::NotFound)));
    }

    #[tokio::test]
    async fn cleanup_enforces_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_secs(3600));

        for i in 0..4u8 {
            let body = vec![i; 100];
            let digest = digest_of(&body);
            store.put(&digest, body.as_slice(), "").await.unwrap();
        }

        let (removed, remaining_count, remaining_size) = store.cleanup(250).await;
        assert!(removed >= 2, "removed {removed} entries");
        assert!(remaining_size <= 250);
        assert_eq!(remaining_count + removed, 4);
    }

    #[tokio::test]
    async fn load_index_rebuilds_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let bodies: Vec<Vec<u8>> = vec![b"one".to_vec(), b"two!".to_vec()];

        {
            let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_secs(3600));
            for body in &bodies {
                store.put(&digest_of(body), body.as_slice(), "").await.unwrap();
            }
        }

        let store = FileBlobStore::new(dir.path().to_path_buf(), Duration::from_secs(3600));
        let (count, total_size) = store.load_index().await;
        assert_eq!(count, 2);
        assert_eq!(total_size, 7);

        for body in &bodies {
            assert!(store.stat(&digest_of(body)).await.is_ok());
        }
    }
}
