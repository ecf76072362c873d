//! Multi-target execution.
//!
//! One build task per target platform, spawned into a `JoinSet` and bounded by
//! a semaphore. The join is a barrier: every task runs to its natural
//! completion (a failing target does not cancel its siblings) and the caller
//! only sees the collected [`TargetResults`]. Callers decide what a partial
//! failure means; the release orchestrator treats any failure as fatal.

mod types;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::build::{BuildError, ImageArtifact, build_image};
use crate::cache::CacheMode;
use crate::platform::Platform;

pub use types::{ExecuteConfig, SharedInputs, TargetError, TargetResults};

type TargetOutcome = (Platform, Result<ImageArtifact, TargetError>);

/// Build every target concurrently and wait for all of them.
///
/// Duplicate platforms are built once. Cancellation is observed before each
/// build starts; builds already running are left to finish.
pub async fn build_targets(
  targets: &[Platform],
  inputs: &SharedInputs,
  config: &ExecuteConfig,
  cancel: &CancellationToken,
) -> TargetResults {
  let mut seen = HashSet::new();
  let targets: Vec<Platform> = targets.iter().filter(|p| seen.insert(*p)).cloned().collect();

  info!(
    targets = targets.len(),
    parallelism = config.parallelism,
    "starting target builds"
  );

  let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));
  let mut join_set = JoinSet::new();

  for platform in &targets {
    let platform = platform.clone();
    let inputs = inputs.clone();
    let semaphore = semaphore.clone();
    let cancel = cancel.clone();
    let mode = config.cache_mode;
    let span = info_span!("target", platform = %platform);

    join_set.spawn(
      async move {
        let Ok(_permit) = semaphore.acquire().await else {
          return (platform, Err(TargetError::Aborted("semaphore closed".to_string())));
        };
        if cancel.is_cancelled() {
          return (platform, Err(TargetError::Cancelled));
        }

        let result = build_target(&inputs, &platform, mode).await;
        (platform, result)
      }
      .instrument(span),
    );
  }

  let outcomes = collect_join_results(join_set).await;

  let mut results = TargetResults::default();
  for (platform, outcome) in outcomes {
    match outcome {
      Ok(artifact) => {
        info!(platform = %platform, digest = %artifact.manifest_digest(), "target succeeded");
        results.built.insert(platform, artifact);
      }
      Err(e) => {
        error!(platform = %platform, error = %e, "target failed");
        results.failed.push((platform, e));
      }
    }
  }

  // A task that panicked never reported its platform.
  for platform in targets {
    let reported = results.built.contains_key(&platform) || results.failed.iter().any(|(p, _)| *p == platform);
    if !reported {
      warn!(platform = %platform, "target task did not report a result");
      results
        .failed
        .push((platform, TargetError::Aborted("task panicked".to_string())));
    }
  }
  results.failed.sort_by(|a, b| a.0.cmp(&b.0));

  info!(
    built = results.built.len(),
    failed = results.failed.len(),
    "target builds complete"
  );

  results
}

/// Resolve the base for `platform`, then build on it.
async fn build_target(inputs: &SharedInputs, platform: &Platform, mode: CacheMode) -> Result<ImageArtifact, TargetError> {
  let base = inputs
    .base
    .resolve(&inputs.recipe.base, platform)
    .await
    .map_err(BuildError::from)?;
  let artifact = build_image(
    &inputs.recipe,
    &inputs.context,
    platform,
    &base,
    inputs.base.as_ref(),
    inputs.cache.as_ref(),
    inputs.executor.as_ref(),
    mode,
  )
  .await?;
  Ok(artifact)
}

/// Collect results from a JoinSet of target tasks.
async fn collect_join_results(mut join_set: JoinSet<TargetOutcome>) -> Vec<TargetOutcome> {
  let mut results = Vec::new();

  while let Some(join_result) = join_set.join_next().await {
    match join_result {
      Ok(outcome) => results.push(outcome),
      Err(e) => {
        error!(error = %e, "build task panicked");
      }
    }
  }

  results
}
