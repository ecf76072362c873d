//! Registry-backed layer cache, shared between builders.
//!
//! Each entry is a small image manifest in a dedicated cache repository,
//! tagged `layer-<cache key>`. Its single layer is the cached blob and its
//! config blob records the layer's diff id:
//!
//! ```text
//! <repo>-buildcache:layer-<key>  ->  manifest
//!                                     config  {"diffId": "sha256:..."}
//!                                     layers  [<layer blob>]
//! ```
//!
//! The cache never fails a build. Read errors are logged and count as a miss,
//! write errors are logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::{CacheError, CacheKey, CachedLayer, LayerCache};
use crate::oci::{Blob, Digest, ImageManifest, MEDIA_TYPE_MANIFEST};
use crate::registry::{Registry, RegistryError, SessionKeeper};
use crate::secret::Credentials;

/// Media type of the config blob of a cache entry.
pub const MEDIA_TYPE_CACHE_CONFIG: &str = "application/vnd.probeship.cache.config.v1+json";

/// Suffix of the default cache repository.
pub const CACHE_REPOSITORY_SUFFIX: &str = "-buildcache";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryConfig {
  diff_id: Digest,
}

#[derive(Debug, Error)]
enum EntryError {
  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error("malformed cache entry: {0}")]
  Malformed(String),
}

pub struct RegistryCache {
  keeper: SessionKeeper,
}

impl RegistryCache {
  pub fn new(registry: Arc<dyn Registry>, repository: &str, credentials: Credentials) -> Self {
    Self {
      keeper: SessionKeeper::push(registry, repository, credentials),
    }
  }

  /// The default cache repository for images published to `repository`.
  pub fn repository_for(repository: &str) -> String {
    format!("{}{}", repository, CACHE_REPOSITORY_SUFFIX)
  }

  pub fn repository(&self) -> &str {
    self.keeper.repository()
  }

  fn tag(key: &CacheKey) -> String {
    format!("layer-{}", key.as_str())
  }

  async fn read(&self, key: &CacheKey) -> Result<Option<CachedLayer>, EntryError> {
    let session = self.keeper.session().await?;
    let registry = self.keeper.registry();
    let Some(manifest) = registry.fetch_manifest(&session, &Self::tag(key)).await? else {
      return Ok(None);
    };

    let manifest: ImageManifest =
      serde_json::from_slice(&manifest.body).map_err(|e| EntryError::Malformed(e.to_string()))?;
    if manifest.config.media_type != MEDIA_TYPE_CACHE_CONFIG {
      return Err(EntryError::Malformed(format!(
        "unexpected config type {}",
        manifest.config.media_type
      )));
    }
    let [descriptor] = <[_; 1]>::try_from(manifest.layers)
      .map_err(|layers| EntryError::Malformed(format!("expected one layer, found {}", layers.len())))?;

    let config = registry.fetch_blob(&session, &manifest.config.digest).await?;
    let config: EntryConfig = serde_json::from_slice(&config).map_err(|e| EntryError::Malformed(e.to_string()))?;
    let data = registry.fetch_blob(&session, &descriptor.digest).await?;

    Ok(Some(CachedLayer {
      descriptor,
      diff_id: config.diff_id,
      data,
    }))
  }

  async fn write(&self, key: &CacheKey, layer: &CachedLayer) -> Result<(), EntryError> {
    let session = self.keeper.session().await?;
    let registry = self.keeper.registry();

    let config = Blob::from_json(
      MEDIA_TYPE_CACHE_CONFIG,
      &EntryConfig {
        diff_id: layer.diff_id.clone(),
      },
    )
    .map_err(|e| EntryError::Malformed(e.to_string()))?;

    for (digest, data) in [
      (&layer.descriptor.digest, layer.data.as_slice()),
      (&config.descriptor.digest, config.data.as_slice()),
    ] {
      if !registry.blob_exists(&session, digest).await? {
        registry.push_blob(&session, digest, data).await?;
      }
    }

    let manifest = Blob::from_json(
      MEDIA_TYPE_MANIFEST,
      &ImageManifest::new(config.descriptor, vec![layer.descriptor.clone()]),
    )
    .map_err(|e| EntryError::Malformed(e.to_string()))?;
    registry
      .push_manifest(&session, &Self::tag(key), MEDIA_TYPE_MANIFEST, &manifest.data)
      .await?;
    Ok(())
  }
}

#[async_trait]
impl LayerCache for RegistryCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<CachedLayer>, CacheError> {
    match self.read(key).await {
      Ok(hit) => Ok(hit),
      Err(e) => {
        warn!(repository = %self.repository(), key = %key.0.short(12), error = %e, "shared cache read failed");
        Ok(None)
      }
    }
  }

  async fn put(&self, key: &CacheKey, layer: &CachedLayer) -> Result<(), CacheError> {
    match self.write(key, layer).await {
      Ok(()) => debug!(repository = %self.repository(), key = %key.0.short(12), "exported layer"),
      Err(e) => warn!(repository = %self.repository(), key = %key.0.short(12), error = %e, "shared cache write failed"),
    }
    Ok(())
  }
}
