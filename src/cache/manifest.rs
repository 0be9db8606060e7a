use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::debug;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::{expiry, CacheError, CacheEntry};

/// Manifest store keyed by `repo/reference`, one JSON file per entry under
/// a sha-sharded path. Tag references get the short TTL (the tag may move),
/// digest references the long one (the content cannot).
pub struct FileManifestStore {
    dir: PathBuf,
    tag_ttl: Duration,
    digest_ttl: Duration,
    index: RwLock<HashMap<String, CacheEntry>>,
}

impl FileManifestStore {
    pub fn new(dir: PathBuf, tag_ttl: Duration, digest_ttl: Duration) -> Self {
        Self {
            dir,
            tag_ttl,
            digest_ttl,
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl_for_reference(&self, reference: &str) -> Duration {
        if reference.starts_with("sha256:") {
            self.digest_ttl
        } else {
            self.tag_ttl
        }
    }

    pub async fn get(&self, repo: &str, reference: &str) -> Result<CacheEntry, CacheError> {
        let key = index_key(repo, reference);

        {
            let index = self.index.read().await;
            if let Some(entry) = index.get(&key) {
                if Utc::now() < entry.expires_at {
                    return Ok(entry.clone());
                }
            }
        }
        self.index.write().await.remove(&key);

        let path = self.entry_path(repo, reference);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => return Err(CacheError::NotFound),
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(error) => {
                debug!("removing unreadable manifest entry {}: {error}", path.display());
                let _ = tokio::fs::remove_file(&path).await;
                return Err(CacheError::NotFound);
            }
        };

        if Utc::now() > entry.expires_at {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(CacheError::Expired);
        }

        self.index.write().await.insert(key, entry.clone());
        Ok(entry)
    }

    /// Stores an entry, restamping its expiry from the reference kind.
    pub async fn put(
        &self,
        repo: &str,
        reference: &str,
        mut entry: CacheEntry,
    ) -> Result<(), CacheError> {
        let now = Utc::now();
        entry.cached_at = now;
        entry.expires_at = expiry(now, self.ttl_for_reference(reference));

        let path = self.entry_path(repo, reference);
        let dir = path.parent().expect("sharded manifest path has a parent");
        tokio::fs::create_dir_all(dir).await?;

        let bytes = serde_json::to_vec(&entry).map_err(|e| {
            CacheError::Io(format!("failed to serialize manifest entry: {e}"))
        })?;
        tokio::fs::write(&path, bytes).await?;

        self.index
            .write()
            .await
            .insert(index_key(repo, reference), entry);
        Ok(())
    }

    pub async fn delete(&self, repo: &str, reference: &str) {
        self.index.write().await.remove(&index_key(repo, reference));
        let _ = tokio::fs::remove_file(self.entry_path(repo, reference)).await;
    }

    /// TTL sweep. Returns (removed entries, remaining count, remaining size).
    pub async fn cleanup(&self) -> (usize, usize, u64) {
        let now = Utc::now();
        let mut to_delete = Vec::new();

        {
            let index = self.index.read().await;
            for (key, entry) in index.iter() {
                if now > entry.expires_at {
                    to_delete.push(key.clone());
                }
            }
        }

        {
            let mut index = self.index.write().await;
            for key in &to_delete {
                index.remove(key);
            }
        }
        for key in &to_delete {
            let _ = tokio::fs::remove_file(self.dir.join(key)).await;
        }

        let (remaining_count, remaining_size) = {
            let index = self.index.read().await;
            let size = index.values().map(|e| e.descriptor.size).sum();
            (index.len(), size)
        };
        (to_delete.len(), remaining_count, remaining_size)
    }

    /// Rebuilds the index from disk, dropping expired files.
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

            while let Ok(Some(dir_entry)) = entries.next_entry().await {
                let path = dir_entry.path();
                if dir_entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false)
                {
                    stack.push(path);
                    continue;
                }

                let Ok(bytes) = tokio::fs::read(&path).await else {
                    continue;
                };
                let Ok(entry) = serde_json::from_slice::<CacheEntry>(&bytes) else {
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                };

                if Utc::now() > entry.expires_at {
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.dir) else {
                    continue;
                };
                let key = relative.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");

                count += 1;
                total_size += entry.descriptor.size as i64;
                self.index.write().await.insert(key, entry);
            }
        }

        (count, total_size)
    }

    fn entry_path(&self, repo: &str, reference: &str) -> PathBuf {
        self.dir.join(entry_file_name(repo, reference))
    }
}

/// References contain characters that do not survive as file names; the
/// entry file is named by the hash of `repo/reference` instead.
fn entry_file_name(repo: &str, reference: &str) -> PathBuf {
    let hash = format!("{:x}", Sha256::digest(format!("{repo}/{reference}").as_bytes()));
    Path::new(&hash[0..2])
        .join(&hash[2..4])
        .join(format!("{hash}.json"))
}

/// The memory index is keyed by the entry's relative path so entries loaded
/// back from a disk walk land under the same key as fresh puts.
fn index_key(repo: &str, reference: &str) -> String {
    entry_file_name(repo, reference)
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "/")
}
