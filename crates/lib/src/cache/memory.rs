//! In-process layer cache, used for dry runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CacheError, CacheKey, CachedLayer, LayerCache};

#[derive(Debug, Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<CacheKey, CachedLayer>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn len(&self) -> usize {
    self.entries.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.entries.lock().await.is_empty()
  }

  pub async fn contains(&self, key: &CacheKey) -> bool {
    self.entries.lock().await.contains_key(key)
  }
}

#[async_trait]
impl LayerCache for MemoryCache {
  async fn get(&self, key: &CacheKey) -> Result<Option<CachedLayer>, CacheError> {
    Ok(self.entries.lock().await.get(key).cloned())
  }

  async fn put(&self, key: &CacheKey, layer: &CachedLayer) -> Result<(), CacheError> {
    self.entries.lock().await.insert(key.clone(), layer.clone());
    Ok(())
  }
}
