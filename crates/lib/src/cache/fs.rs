//! Filesystem layer cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! keys/<cache-key>.json     record: descriptor + diff id
//! blobs/sha256/<hex>        compressed layer bytes
//! ```
//!
//! Blobs are written before records, both through a temp file in the target
//! directory followed by a rename. A reader that finds a record therefore
//! always finds its blob. Blobs are verified against their digest on read; a
//! mismatch is treated as a miss.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{CacheError, CacheKey, CachedLayer, LayerCache};
use crate::oci::{Descriptor, Digest};
use crate::platform::paths::layer_cache_dir;

const RECORD_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
  version: u32,
  descriptor: Descriptor,
  diff_id: Digest,
}

/// Summary of what a cache directory holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub entries: usize,
  pub blobs: usize,
  pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct FsCache {
  root: PathBuf,
}

impl FsCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Cache at the default location (see [`layer_cache_dir`]).
  pub fn default_location() -> Self {
    Self::new(layer_cache_dir())
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn keys_dir(&self) -> PathBuf {
    self.root.join("keys")
  }

  fn blobs_dir(&self) -> PathBuf {
    self.root.join("blobs").join("sha256")
  }

  fn record_path(&self, key: &CacheKey) -> PathBuf {
    self.keys_dir().join(format!("{}.json", key.as_str()))
  }

  fn blob_path(&self, digest: &Digest) -> PathBuf {
    self.blobs_dir().join(digest.hex())
  }

  fn read(&self, key: &CacheKey) -> Result<Option<CachedLayer>, CacheError> {
    let record_path = self.record_path(key);
    let content = match fs::read_to_string(&record_path) {
      Ok(content) => content,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(io_error(&record_path, source)),
    };

    let record: CacheRecord = match serde_json::from_str(&content) {
      Ok(record) => record,
      Err(e) => {
        warn!(key = %key.0.short(12), error = %e, "ignoring unreadable cache record");
        return Ok(None);
      }
    };
    if record.version != RECORD_VERSION {
      debug!(key = %key.0.short(12), version = record.version, "ignoring cache record from another version");
      return Ok(None);
    }

    let blob_path = self.blob_path(&record.descriptor.digest);
    let data = match fs::read(&blob_path) {
      Ok(data) => data,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        warn!(key = %key.0.short(12), "cache record without blob");
        return Ok(None);
      }
      Err(source) => return Err(io_error(&blob_path, source)),
    };

    if Digest::of(&data) != record.descriptor.digest {
      warn!(key = %key.0.short(12), digest = %record.descriptor.digest, "cached blob does not match its digest");
      return Ok(None);
    }

    Ok(Some(CachedLayer {
      descriptor: record.descriptor,
      diff_id: record.diff_id,
      data,
    }))
  }

  fn write(&self, key: &CacheKey, layer: &CachedLayer) -> Result<(), CacheError> {
    let blob_path = self.blob_path(&layer.descriptor.digest);
    if !blob_path.exists() {
      write_atomic(&blob_path, &layer.data)?;
    }

    let record = CacheRecord {
      version: RECORD_VERSION,
      descriptor: layer.descriptor.clone(),
      diff_id: layer.diff_id.clone(),
    };
    let content = serde_json::to_vec_pretty(&record)?;
    write_atomic(&self.record_path(key), &content)
  }

  /// Count entries and blob bytes. A missing cache directory is empty.
  pub fn stats(&self) -> Result<CacheStats, CacheError> {
    let mut stats = CacheStats::default();

    for (dir, is_blob) in [(self.keys_dir(), false), (self.blobs_dir(), true)] {
      let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
        Err(source) => return Err(io_error(&dir, source)),
      };
      for entry in entries {
        let entry = entry.map_err(|source| io_error(&dir, source))?;
        let metadata = entry.metadata().map_err(|source| io_error(&entry.path(), source))?;
        if !metadata.is_file() {
          continue;
        }
        if is_blob {
          stats.blobs += 1;
          stats.bytes += metadata.len();
        } else if entry.path().extension().is_some_and(|e| e == "json") {
          stats.entries += 1;
        }
      }
    }

    Ok(stats)
  }

  /// Remove every entry. Returns what was removed.
  pub fn clear(&self) -> Result<CacheStats, CacheError> {
    let stats = self.stats()?;
    match fs::remove_dir_all(&self.root) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(source) => return Err(io_error(&self.root, source)),
    }
    Ok(stats)
  }
}

#[async_trait]
impl LayerCache for FsCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<CachedLayer>, CacheError> {
    let cache = self.clone();
    let key = key.clone();
    tokio::task::spawn_blocking(move || cache.read(&key))
      .await
      .map_err(|e| CacheError::Task(e.to_string()))?
  }

  async fn put(&self, key: &CacheKey, layer: &CachedLayer) -> Result<(), CacheError> {
    let cache = self.clone();
    let key = key.clone();
    let layer = layer.clone();
    tokio::task::spawn_blocking(move || cache.write(&key, &layer))
      .await
      .map_err(|e| CacheError::Task(e.to_string()))?
  }
}

/// Write `data` to `path` via a uniquely named temp file in the same directory.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CacheError> {
  let dir = path.parent().unwrap_or(Path::new("."));
  fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;

  let mut temp = NamedTempFile::new_in(dir).map_err(|source| io_error(dir, source))?;
  temp.write_all(data).map_err(|source| io_error(path, source))?;
  temp.as_file().sync_all().map_err(|source| io_error(path, source))?;
  temp.persist(path).map_err(|e| io_error(path, e.error))?;
  Ok(())
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
  CacheError::Io {
    path: path.display().to_string(),
    source,
  }
}
