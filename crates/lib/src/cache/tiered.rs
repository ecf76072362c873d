//! A local cache in front of a shared one.

use async_trait::async_trait;
use tracing::debug;

use super::{CacheError, CacheKey, CachedLayer, LayerCache};

/// Reads try `local` first, then `remote`; remote hits are copied into
/// `local`. Writes go to both.
pub struct TieredCache<L, R> {
  local: L,
  remote: R,
}

impl<L: LayerCache, R: LayerCache> TieredCache<L, R> {
  pub fn new(local: L, remote: R) -> Self {
    Self { local, remote }
  }

  pub fn local(&self) -> &L {
    &self.local
  }

  pub fn remote(&self) -> &R {
    &self.remote
  }
}

#[async_trait]
impl<L: LayerCache, R: LayerCache> LayerCache for TieredCache<L, R> {
  async fn get(&self, key: &CacheKey) -> Result<Option<CachedLayer>, CacheError> {
    if let Some(layer) = self.local.get(key).await? {
      return Ok(Some(layer));
    }
    let Some(layer) = self.remote.get(key).await? else {
      return Ok(None);
    };
    debug!(key = %key.0.short(12), "shared cache hit");
    self.local.put(key, &layer).await?;
    Ok(Some(layer))
  }

  async fn put(&self, key: &CacheKey, layer: &CachedLayer) -> Result<(), CacheError> {
    self.local.put(key, layer).await?;
    self.remote.put(key, layer).await
  }
}
