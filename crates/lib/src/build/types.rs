//! Types for per-platform image builds.

use serde::Serialize;
use thiserror::Error;

use super::base::{BaseError, ResolvedBase};
use super::layer::LayerError;
use crate::cache::{CacheError, CacheKey, CachedLayer};
use crate::context::ContextError;
use crate::oci::{Blob, Digest, OciError};
use crate::platform::Platform;
use crate::recipe::RecipeError;

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("invalid recipe: {0}")]
  Recipe(#[from] RecipeError),

  #[error(transparent)]
  Context(#[from] ContextError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Oci(#[from] OciError),

  #[error(transparent)]
  Layer(#[from] LayerError),

  #[error(transparent)]
  Base(#[from] BaseError),

  /// `RUN` needs an isolating wrapper to run in the image's root filesystem.
  #[error("[{platform}] step '{step}' needs build.process.wrapper to run isolated")]
  Unisolated { platform: Platform, step: String },

  /// A `RUN` command exited unsuccessfully.
  #[error("[{platform}] command failed with exit code {code:?}: {command}")]
  CmdFailed {
    platform: Platform,
    command: String,
    code: Option<i32>,
  },

  /// A step could not be executed at all.
  #[error("[{platform}] step '{step}' failed: {message}")]
  StepFailed {
    platform: Platform,
    step: String,
    message: String,
  },
}

/// How an instruction was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
  /// Layer reused from the cache; the instruction did not run.
  Cached,
  /// Layer produced by running the instruction.
  Built,
  /// Metadata-only instruction, recorded in the image config.
  Config,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
  pub instruction: String,
  pub key: CacheKey,
  pub status: StepStatus,
  /// Whether the layer was written back to the cache.
  pub exported: bool,
}

/// A built image for one platform, local to the builder until published.
#[derive(Debug, Clone)]
pub struct ImageArtifact {
  pub platform: Platform,
  pub base: ResolvedBase,
  /// Layers produced by the recipe, on top of the base layers.
  pub layers: Vec<CachedLayer>,
  pub config: Blob,
  pub manifest: Blob,
  pub steps: Vec<StepRecord>,
}

impl ImageArtifact {
  pub fn manifest_digest(&self) -> &Digest {
    &self.manifest.descriptor.digest
  }

  pub fn cache_hits(&self) -> usize {
    self.steps.iter().filter(|s| s.status == StepStatus::Cached).count()
  }

  pub fn cache_misses(&self) -> usize {
    self.steps.iter().filter(|s| s.status == StepStatus::Built).count()
  }

  /// Total compressed size of the layers the recipe produced.
  pub fn layer_bytes(&self) -> u64 {
    self.layers.iter().map(|l| l.descriptor.size).sum()
  }
}
