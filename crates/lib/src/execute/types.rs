//! Types for multi-target execution.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::build::{BaseSource, BuildError, ImageArtifact, StepExecutor};
use crate::cache::{CacheMode, LayerCache};
use crate::context::BuildContext;
use crate::platform::Platform;
use crate::recipe::ImageRecipe;

/// Why a target produced no image.
#[derive(Debug, Error)]
pub enum TargetError {
  #[error(transparent)]
  Build(#[from] BuildError),

  /// The build task panicked or was aborted.
  #[error("build task did not complete: {0}")]
  Aborted(String),

  /// Cancellation was requested before the build started.
  #[error("cancelled before the build started")]
  Cancelled,
}

/// Read-only inputs shared by every target task.
#[derive(Clone)]
pub struct SharedInputs {
  pub recipe: Arc<ImageRecipe>,
  pub context: Arc<BuildContext>,
  /// Resolves the recipe's base image per target.
  pub base: Arc<dyn BaseSource>,
  pub cache: Arc<dyn LayerCache>,
  pub executor: Arc<dyn StepExecutor>,
}

/// Configuration for target execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of targets built at once.
  pub parallelism: usize,
  pub cache_mode: CacheMode,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
      cache_mode: CacheMode::default(),
    }
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// Outcome of building every target, collected at the join barrier.
#[derive(Debug, Default)]
pub struct TargetResults {
  /// Successfully built images.
  pub built: BTreeMap<Platform, ImageArtifact>,

  /// Targets that failed, in platform order.
  pub failed: Vec<(Platform, TargetError)>,
}

impl TargetResults {
  /// Returns true if every target produced an image.
  pub fn is_success(&self) -> bool {
    self.failed.is_empty()
  }

  /// Returns the total number of targets processed.
  pub fn total(&self) -> usize {
    self.built.len() + self.failed.len()
  }

  /// Images in the given target order. `None` unless every target succeeded.
  pub fn ordered(&self, targets: &[Platform]) -> Option<Vec<&ImageArtifact>> {
    if !self.is_success() {
      return None;
    }
    targets.iter().map(|p| self.built.get(p)).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::arch::Arch;
  use crate::platform::os::Os;

  #[test]
  fn empty_results_are_successful() {
    let result = TargetResults::default();
    assert!(result.is_success());
    assert_eq!(result.total(), 0);
    assert!(result.ordered(&[]).unwrap().is_empty());
  }

  #[test]
  fn any_failure_withholds_ordered_images() {
    let mut result = TargetResults::default();
    result
      .failed
      .push((Platform::new(Os::Linux, Arch::Arm64), TargetError::Cancelled));

    assert!(!result.is_success());
    assert_eq!(result.total(), 1);
    assert!(result.ordered(&[Platform::new(Os::Linux, Arch::Arm64)]).is_none());
  }

  #[test]
  fn default_parallelism_is_positive() {
    assert!(ExecuteConfig::default().parallelism >= 1);
  }
}
