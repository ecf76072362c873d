//! Content-addressed layer cache.
//!
//! Each layer-producing instruction has a [`CacheKey`] derived from everything
//! that can change its output:
//! - the key of the previous instruction (so order matters)
//! - the resolved base image (by manifest digest) and target platform
//! - the instruction itself
//! - the content hash of the context input it reads, if any
//!
//! Entries are never mutated once written. Two writers racing on the same key
//! write identical bytes, so backends only need atomic replacement.
//!
//! Backends: [`FsCache`] on local disk, [`MemoryCache`] for tests, and
//! [`RegistryCache`] shared between builders through a registry repository.
//! [`TieredCache`] puts a local cache in front of a shared one.

pub mod fs;
pub mod memory;
pub mod registry;
pub mod tiered;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::oci::{Descriptor, Digest};
use crate::platform::Platform;
use crate::recipe::Instruction;
use crate::util::hash::{ContentHash, HashError, Hashable};

pub use fs::{CacheStats, FsCache};
pub use memory::MemoryCache;
pub use registry::RegistryCache;
pub use tiered::TieredCache;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache i/o error at {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to encode cache record: {0}")]
  Encode(#[from] HashError),

  #[error("cache task failed: {0}")]
  Task(String),
}

/// Which layers a build writes back to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
  /// Only the final layer of each image.
  Min,
  /// Every intermediate layer.
  #[default]
  Max,
}

impl CacheMode {
  /// Whether a layer should be exported.
  pub fn exports(&self, is_final_layer: bool) -> bool {
    match self {
      Self::Min => is_final_layer,
      Self::Max => true,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Min => "min",
      Self::Max => "max",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(pub ContentHash);

#[derive(Serialize)]
struct KeyMaterial<'a> {
  parent: Option<&'a str>,
  base: &'a str,
  platform: String,
  instruction: &'a Instruction,
  input: Option<&'a str>,
}

impl Hashable for KeyMaterial<'_> {}

impl CacheKey {
  pub fn derive(
    parent: Option<&CacheKey>,
    base: &Digest,
    platform: &Platform,
    instruction: &Instruction,
    input: Option<&ContentHash>,
  ) -> Result<Self, CacheError> {
    let material = KeyMaterial {
      parent: parent.map(|k| k.0.0.as_str()),
      base: base.as_str(),
      platform: platform.to_string(),
      instruction,
      input: input.map(|h| h.0.as_str()),
    };
    Ok(Self(material.compute_hash()?))
  }

  pub fn as_str(&self) -> &str {
    &self.0.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A layer stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedLayer {
  /// Descriptor of the compressed blob.
  pub descriptor: Descriptor,
  /// Digest of the uncompressed tar stream.
  pub diff_id: Digest,
  pub data: Vec<u8>,
}

#[async_trait]
pub trait LayerCache: Send + Sync {
  async fn get(&self, key: &CacheKey) -> Result<Option<CachedLayer>, CacheError>;

  async fn put(&self, key: &CacheKey, layer: &CachedLayer) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::arch::Arch;
  use crate::platform::os::Os;
  use crate::util::hash::hash_bytes;

  fn run(command: &str) -> Instruction {
    Instruction::Run {
      command: command.to_string(),
    }
  }

  fn base() -> Digest {
    Digest::of(b"python:3.11.9-slim-bookworm linux/amd64")
  }

  #[test]
  fn key_depends_on_every_component() {
    let amd64 = Platform::new(Os::Linux, Arch::Amd64);
    let arm64 = Platform::new(Os::Linux, Arch::Arm64);
    let input = hash_bytes(b"requirements");

    let key = CacheKey::derive(None, &base(), &amd64, &run("pip install"), Some(&input)).unwrap();

    assert_eq!(
      key,
      CacheKey::derive(None, &base(), &amd64, &run("pip install"), Some(&input)).unwrap()
    );
    assert_ne!(
      key,
      CacheKey::derive(None, &base(), &arm64, &run("pip install"), Some(&input)).unwrap()
    );
    assert_ne!(
      key,
      CacheKey::derive(None, &base(), &amd64, &run("pip install -U"), Some(&input)).unwrap()
    );
    assert_ne!(
      key,
      CacheKey::derive(None, &base(), &amd64, &run("pip install"), Some(&hash_bytes(b"other"))).unwrap()
    );
    assert_ne!(
      key,
      CacheKey::derive(Some(&key), &base(), &amd64, &run("pip install"), Some(&input)).unwrap()
    );

    // same tag, republished upstream
    let other_base = Digest::of(b"python:3.11.9-slim-bookworm linux/amd64 rebuilt");
    assert_ne!(
      key,
      CacheKey::derive(None, &other_base, &amd64, &run("pip install"), Some(&input)).unwrap()
    );
  }

  #[test]
  fn min_mode_exports_only_final_layer() {
    assert!(CacheMode::Max.exports(false));
    assert!(CacheMode::Max.exports(true));
    assert!(!CacheMode::Min.exports(false));
    assert!(CacheMode::Min.exports(true));
    assert_eq!(CacheMode::default(), CacheMode::Max);
  }
}
