//! Content-addressed build cache.
//!
//! Maps `(os, arch, binary, source-hash)` keys to stored binary blobs with a
//! TTL and a size cap. One directory holds a JSON metadata file plus one
//! blob per entry named `<key>_<basename-of-source>`; the metadata file is
//! rewritten atomically on every mutation. Cache failures never fail the
//! surrounding build; callers downgrade errors to a miss and log a warning.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CacheOverflow;
use crate::hash::{self, HashAlgorithm};
use crate::state::write_json_atomic;

pub const METADATA_FILE: &str = "cache.json";

/// Hex chars kept from the sha256 of the joined key parts.
const KEY_LEN: usize = 16;

/// Hex chars of each per-source-file hash folded into the key.
const SOURCE_HASH_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Content hash of the stored blob.
    pub hash: String,
    /// Absolute path of the blob inside the cache directory.
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl CacheEntry {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CacheIndex {
    entries: BTreeMap<String, CacheEntry>,
}

/// Result of a `put`, surfacing capacity effects so the caller can log them.
#[derive(Debug)]
pub struct CachePut {
    pub entry: CacheEntry,
    /// Keys evicted to make room (evict-oldest policy only).
    pub evicted: Vec<String>,
    /// The store exceeds its cap after this put (warn-and-accept policy).
    pub over_capacity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub expired: usize,
    pub total_bytes: u64,
}

#[derive(Debug)]
pub struct BuildCache {
    dir: PathBuf,
    max_size: u64,
    overflow: CacheOverflow,
    index: Mutex<CacheIndex>,
}

impl BuildCache {
    /// Open (or create) the cache directory and load its metadata. Corrupt
    /// metadata starts the cache empty rather than failing the run.
    pub fn open(dir: impl Into<PathBuf>, max_size: u64, overflow: CacheOverflow) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;

        let metadata_path = dir.join(METADATA_FILE);
        let index = if metadata_path.exists() {
            fs::read_to_string(&metadata_path)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default()
        } else {
            CacheIndex::default()
        };

        Ok(Self {
            dir,
            max_size,
            overflow,
            index: Mutex::new(index),
        })
    }

    /// Build a cache key from its parts:
    /// `truncate16(hex(sha256(join(parts))))`.
    pub fn cache_key(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(parts.join("|").as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(KEY_LEN);
        digest
    }

    /// The standard build key: target identity, binary name, and a short
    /// hash per stable source file matched under `root`.
    pub fn build_key(
        root: &Path,
        os: &str,
        arch: &str,
        binary: &str,
        source_patterns: &[String],
    ) -> Result<String> {
        let mut parts: Vec<String> = vec![os.to_string(), arch.to_string(), binary.to_string()];
        let mut source_hash =
            hash::hash_dir_tree(root, source_patterns, HashAlgorithm::Sha256)?;
        source_hash.truncate(SOURCE_HASH_LEN);
        parts.push(source_hash);
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        Ok(Self::cache_key(&refs))
    }

    /// Look up a live entry. Expired entries and entries whose blob has
    /// vanished from disk are evicted and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut index = self.index.lock().expect("cache lock poisoned");
        let entry = index.entries.get(key)?.clone();

        if entry.expired(Utc::now()) || !entry.path.exists() {
            let removed = index.entries.remove(key);
            if let Some(stale) = removed {
                let _ = fs::remove_file(&stale.path);
            }
            let _ = self.write_index(&index);
            return None;
        }
        Some(entry)
    }

    /// Copy `src` into the cache under a deterministic blob name, record
    /// content hash and size, and rewrite the metadata file.
    pub fn put(
        &self,
        key: &str,
        src: &Path,
        ttl: Duration,
        metadata: BTreeMap<String, String>,
    ) -> Result<CachePut> {
        let basename = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "blob".to_string());
        let blob_path = self.dir.join(format!("{key}_{basename}"));

        fs::copy(src, &blob_path).with_context(|| {
            format!(
                "failed to copy {} into cache at {}",
                src.display(),
                blob_path.display()
            )
        })?;

        let size = fs::metadata(&blob_path)
            .with_context(|| format!("failed to stat cache blob {}", blob_path.display()))?
            .len();
        let content_hash = hash::hash_file(&blob_path, HashAlgorithm::Sha256)?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let entry = CacheEntry {
            key: key.to_string(),
            hash: content_hash,
            path: blob_path,
            created_at: now,
            expires_at: now + ttl,
            size,
            metadata,
        };

        let mut index = self.index.lock().expect("cache lock poisoned");

        // Prospective total excludes any entry being replaced under this key.
        let mut evicted = Vec::new();
        let mut total: u64 = index
            .entries
            .values()
            .filter(|e| e.key != key)
            .map(|e| e.size)
            .sum::<u64>()
            + entry.size;
        let mut over_capacity = false;

        if total > self.max_size {
            match self.overflow {
                CacheOverflow::WarnAccept => over_capacity = true,
                CacheOverflow::Refuse => {
                    let _ = fs::remove_file(&entry.path);
                    anyhow::bail!(
                        "cache put of {} ({} bytes) would exceed max size {}",
                        key,
                        entry.size,
                        self.max_size
                    );
                }
                CacheOverflow::EvictOldest => {
                    let mut by_age: Vec<(String, DateTime<Utc>, u64)> = index
                        .entries
                        .values()
                        .filter(|e| e.key != key)
                        .map(|e| (e.key.clone(), e.created_at, e.size))
                        .collect();
                    by_age.sort_by_key(|(_, created, _)| *created);
                    for (old_key, _, old_size) in by_age {
                        if total <= self.max_size {
                            break;
                        }
                        if let Some(old) = index.entries.remove(&old_key) {
                            let _ = fs::remove_file(&old.path);
                            total -= old_size;
                            evicted.push(old_key);
                        }
                    }
                    over_capacity = total > self.max_size;
                }
            }
        }

        if let Some(old) = index.entries.remove(key)
            && old.path != entry.path
        {
            let _ = fs::remove_file(&old.path);
        }
        index.entries.insert(key.to_string(), entry.clone());
        self.write_index(&index)?;

        Ok(CachePut {
            entry,
            evicted,
            over_capacity,
        })
    }

    /// Remove one entry's blob and metadata.
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut index = self.index.lock().expect("cache lock poisoned");
        if let Some(entry) = index.entries.remove(key) {
            let _ = fs::remove_file(&entry.path);
            self.write_index(&index)?;
        }
        Ok(())
    }

    /// Delete every expired entry. Returns how many were removed.
    pub fn prune(&self) -> Result<usize> {
        let now = Utc::now();
        let mut index = self.index.lock().expect("cache lock poisoned");
        let stale: Vec<String> = index
            .entries
            .values()
            .filter(|e| e.expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &stale {
            if let Some(entry) = index.entries.remove(key) {
                let _ = fs::remove_file(&entry.path);
            }
        }
        if !stale.is_empty() {
            self.write_index(&index)?;
        }
        Ok(stale.len())
    }

    /// Remove every entry and every stray file in the cache directory
    /// except the metadata file itself.
    pub fn clear(&self) -> Result<()> {
        let mut index = self.index.lock().expect("cache lock poisoned");
        index.entries.clear();

        for dirent in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list cache dir {}", self.dir.display()))?
        {
            let path = dirent.context("failed to read cache dir entry")?.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(METADATA_FILE) {
                continue;
            }
            if path.is_file() {
                let _ = fs::remove_file(&path);
            }
        }
        self.write_index(&index)
    }

    pub fn stats(&self) -> CacheStats {
        let now = Utc::now();
        let index = self.index.lock().expect("cache lock poisoned");
        CacheStats {
            entries: index.entries.len(),
            expired: index.entries.values().filter(|e| e.expired(now)).count(),
            total_bytes: index.entries.values().map(|e| e.size).sum(),
        }
    }

    fn write_index(&self, index: &CacheIndex) -> Result<()> {
        write_json_atomic(&self.dir.join(METADATA_FILE), index)
    }
}
