//! The release run: trigger, authenticate, build every target, publish.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use super::event::ReleaseEvent;
use super::publish::{PublishError, publish};
use super::report::{FailureKind, RunReport, TargetReport};
use super::state::{InvalidTransition, RunState, StateMachine};
use super::tag::{ManualTagPolicy, TagError, derive_tag};
use crate::cache::CacheMode;
use crate::execute::{ExecuteConfig, SharedInputs, build_targets};
use crate::platform::Platform;
use crate::registry::{ImageReference, Registry, RegistryError, SessionKeeper};
use crate::secret::Credentials;

#[derive(Debug, Error)]
pub enum ReleaseError {
  #[error(transparent)]
  Tag(#[from] TagError),

  #[error("invalid image reference: {0}")]
  Reference(#[source] RegistryError),

  #[error(transparent)]
  Auth(RegistryError),

  #[error("no target platforms configured")]
  NoTargets,

  #[error("{} of {} targets failed: {}", .failed.len(), .total, .failed.join(", "))]
  TargetsFailed { failed: Vec<String>, total: usize },

  #[error("publish failed: {0}")]
  Publish(#[source] PublishError),

  #[error("run cancelled")]
  Cancelled,

  #[error(transparent)]
  Transition(#[from] InvalidTransition),
}

impl ReleaseError {
  pub fn kind(&self) -> FailureKind {
    match self {
      ReleaseError::Tag(_) | ReleaseError::Reference(_) => FailureKind::Tag,
      ReleaseError::Auth(_) => FailureKind::Auth,
      ReleaseError::TargetsFailed { .. } => FailureKind::PartialTargets,
      ReleaseError::Publish(_) => FailureKind::Publish,
      ReleaseError::Cancelled => FailureKind::Cancelled,
      ReleaseError::NoTargets | ReleaseError::Transition(_) => FailureKind::Internal,
    }
  }
}

impl From<PublishError> for ReleaseError {
  fn from(err: PublishError) -> Self {
    match err {
      PublishError::Cancelled => ReleaseError::Cancelled,
      other => ReleaseError::Publish(other),
    }
  }
}

/// Where and how a run publishes.
#[derive(Debug, Clone)]
pub struct ReleaseSettings {
  pub repository: String,
  /// Target platforms, in index order.
  pub platforms: Vec<Platform>,
  pub manual_tag: ManualTagPolicy,
  pub execute: ExecuteConfig,
}

/// What a run would do for an event, without doing it.
#[derive(Debug, Clone)]
pub struct ReleasePlan {
  pub reference: ImageReference,
  pub platforms: Vec<Platform>,
  pub cache_mode: CacheMode,
  pub instructions: Vec<String>,
}

pub struct Orchestrator {
  registry: Arc<dyn Registry>,
  inputs: SharedInputs,
  settings: ReleaseSettings,
}

impl Orchestrator {
  pub fn new(registry: Arc<dyn Registry>, inputs: SharedInputs, mut settings: ReleaseSettings) -> Self {
    let mut unique = Vec::with_capacity(settings.platforms.len());
    for platform in settings.platforms.drain(..) {
      if !unique.contains(&platform) {
        unique.push(platform);
      }
    }
    settings.platforms = unique;
    Self {
      registry,
      inputs,
      settings,
    }
  }

  pub fn settings(&self) -> &ReleaseSettings {
    &self.settings
  }

  /// Resolve the image reference an event would publish to.
  pub fn reference_for(&self, event: &ReleaseEvent) -> Result<ImageReference, ReleaseError> {
    let tag = derive_tag(event, &self.settings.manual_tag)?;
    ImageReference::new(self.registry.host(), &self.settings.repository, &tag).map_err(ReleaseError::Reference)
  }

  pub fn plan(&self, event: &ReleaseEvent) -> Result<ReleasePlan, ReleaseError> {
    if self.settings.platforms.is_empty() {
      return Err(ReleaseError::NoTargets);
    }
    Ok(ReleasePlan {
      reference: self.reference_for(event)?,
      platforms: self.settings.platforms.clone(),
      cache_mode: self.settings.execute.cache_mode,
      instructions: self.inputs.recipe.instructions().iter().map(|i| i.describe()).collect(),
    })
  }

  /// Run the release for `event`.
  ///
  /// Always returns a report. Its final state is `Published` or `Failed`;
  /// on failure `failure` and `error` say why.
  pub async fn run(&self, event: ReleaseEvent, credentials: &Credentials, cancel: &CancellationToken) -> RunReport {
    let mut machine = StateMachine::new();
    let mut report = RunReport::new(event.kind(), event.to_string());

    let span = info_span!("release", event = event.kind());
    let result = self
      .execute(&event, credentials, cancel, &mut machine, &mut report)
      .instrument(span)
      .await;

    if let Err(err) = result {
      error!(error = %err, state = %machine.state(), "release failed");
      if !machine.fail() {
        warn!(state = %machine.state(), "run could not be marked failed");
      }
      report.failure = Some(err.kind());
      report.error = Some(err.to_string());
    }

    report.state = machine.state();
    report.history = machine.history().to_vec();
    report.duration_ms = machine.elapsed_ms();
    report
  }

  async fn execute(
    &self,
    event: &ReleaseEvent,
    credentials: &Credentials,
    cancel: &CancellationToken,
    machine: &mut StateMachine,
    report: &mut RunReport,
  ) -> Result<(), ReleaseError> {
    machine.advance(RunState::Triggered)?;
    info!(trigger = %event, "release triggered");

    if self.settings.platforms.is_empty() {
      return Err(ReleaseError::NoTargets);
    }
    let reference = self.reference_for(event)?;
    report.tag = Some(reference.tag.clone());
    report.reference = Some(reference.to_string());

    check_cancelled(cancel)?;
    let keeper = SessionKeeper::push(self.registry.clone(), &self.settings.repository, credentials.clone());
    keeper.session().await.map_err(ReleaseError::Auth)?;
    machine.advance(RunState::Authenticated)?;
    info!(registry = self.registry.host(), repository = %self.settings.repository, "authenticated");

    check_cancelled(cancel)?;
    machine.advance(RunState::Building)?;
    let platforms = &self.settings.platforms;
    let results = build_targets(platforms, &self.inputs, &self.settings.execute, cancel).await;

    for platform in platforms {
      if let Some(image) = results.built.get(platform) {
        report.targets.push(TargetReport::built(image));
      } else if let Some((_, err)) = results.failed.iter().find(|(p, _)| p == platform) {
        report.targets.push(TargetReport::failed(platform, err));
      }
    }

    let Some(images) = results.ordered(platforms) else {
      if cancel.is_cancelled() {
        return Err(ReleaseError::Cancelled);
      }
      return Err(ReleaseError::TargetsFailed {
        failed: results.failed.iter().map(|(p, _)| p.to_string()).collect(),
        total: platforms.len(),
      });
    };
    machine.advance(RunState::AllTargetsReady)?;
    info!(
      targets = images.len(),
      cache_hits = report.cache_hits(),
      cache_misses = report.cache_misses(),
      "all targets ready"
    );

    machine.advance(RunState::Publishing)?;
    // builds can outlast the token issued before them
    keeper.session().await.map_err(ReleaseError::Auth)?;
    let outcome = publish(&keeper, self.inputs.base.as_ref(), &reference.tag, &images, cancel).await?;
    report.index_digest = Some(outcome.index_digest.clone());
    report.blobs_pushed = outcome.blobs_pushed;
    report.blobs_skipped = outcome.blobs_skipped;

    machine.advance(RunState::Published)?;
    info!(reference = %reference, digest = %outcome.index_digest, "published");
    Ok(())
  }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), ReleaseError> {
  if cancel.is_cancelled() {
    Err(ReleaseError::Cancelled)
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use tempfile::TempDir;
  use tracing_test::traced_test;

  use crate::build::base::fixtures::python_layout;
  use crate::build::{BuildError, StepExecutor, StepRequest, layer::pack_tree};
  use crate::cache::{CachedLayer, MemoryCache};
  use crate::context::{BuildContext, ContextLayout};
  use crate::oci::ImageIndex;
  use crate::platform::arch::Arch;
  use crate::platform::os::Os;
  use crate::recipe::{ImageRecipe, Instruction};
  use crate::registry::MemoryRegistry;
  use crate::registry::memory::Upload;
  use std::time::Duration;

  /// Produces a small layer per instruction and can fail one platform.
  #[derive(Default)]
  struct FakeExecutor {
    fail_on: Option<Platform>,
    /// Time each step takes.
    delay: Option<Duration>,
  }

  #[async_trait]
  impl StepExecutor for FakeExecutor {
    async fn execute(&self, request: StepRequest<'_>) -> Result<CachedLayer, BuildError> {
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      if let Instruction::Run { command } = request.instruction
        && self.fail_on.as_ref() == Some(request.platform)
      {
        return Err(BuildError::CmdFailed {
          platform: request.platform.clone(),
          command: command.clone(),
          code: Some(1),
        });
      }
      let dir = TempDir::new().unwrap();
      std::fs::write(
        dir.path().join("out"),
        format!("{} {}", request.platform, request.instruction.describe()),
      )
      .unwrap();
      Ok(pack_tree(dir.path()).unwrap())
    }
  }

  fn context(dir: &TempDir) -> BuildContext {
    let root = dir.path();
    std::fs::write(root.join("requirements.txt"), "scapy==2.5.0\n").unwrap();
    std::fs::create_dir_all(root.join("netprobify")).unwrap();
    std::fs::write(root.join("netprobify/main.py"), "print('probe')\n").unwrap();
    std::fs::write(root.join("netprobify_start.py"), "import netprobify\n").unwrap();
    std::fs::write(root.join("VERSION"), "2.0.0\n").unwrap();
    let recipe = ImageRecipe::netprobify();
    let mut context = BuildContext::open(root, ContextLayout::default()).unwrap();
    context.prepare(&recipe).unwrap();
    context
  }

  fn targets() -> Vec<Platform> {
    vec![Platform::new(Os::Linux, Arch::Amd64), Platform::new(Os::Linux, Arch::Arm64)]
  }

  fn orchestrator(dir: &TempDir, registry: Arc<MemoryRegistry>, executor: FakeExecutor) -> Orchestrator {
    let inputs = SharedInputs {
      recipe: Arc::new(ImageRecipe::netprobify()),
      context: Arc::new(context(dir)),
      base: Arc::new(python_layout(&dir.path().join(".base"), &targets())),
      cache: Arc::new(MemoryCache::new()),
      executor: Arc::new(executor),
    };
    Orchestrator::new(
      registry,
      inputs,
      ReleaseSettings {
        repository: "criteo/netprobify".to_string(),
        platforms: targets(),
        manual_tag: ManualTagPolicy::default(),
        execute: ExecuteConfig::default(),
      },
    )
  }

  fn released(tag: &str) -> ReleaseEvent {
    ReleaseEvent::Released {
      ref_name: tag.to_string(),
    }
  }

  fn creds() -> Credentials {
    Credentials::new("ci-bot", "ghp_do_not_log_me")
  }

  #[tokio::test]
  async fn publishes_one_index_with_every_platform() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io"));
    let orch = orchestrator(&dir, registry.clone(), FakeExecutor::default());

    let report = orch.run(released("v2.0.0"), &creds(), &CancellationToken::new()).await;

    assert_eq!(report.state, RunState::Published, "{:?}", report.error);
    assert_eq!(report.reference.as_deref(), Some("ghcr.io/criteo/netprobify:v2.0.0"));
    let states: Vec<RunState> = report.history.iter().map(|t| t.to).collect();
    assert_eq!(
      states,
      [
        RunState::Triggered,
        RunState::Authenticated,
        RunState::Building,
        RunState::AllTargetsReady,
        RunState::Publishing,
        RunState::Published
      ]
    );

    let stored = registry.manifest("criteo/netprobify", "v2.0.0").await.unwrap();
    let index: ImageIndex = serde_json::from_slice(&stored.body).unwrap();
    assert_eq!(index.manifests.len(), 2);
    assert_eq!(Some(stored.digest), report.index_digest);
  }

  #[tokio::test]
  async fn one_failed_target_publishes_nothing() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io"));
    let executor = FakeExecutor {
      fail_on: Some(Platform::new(Os::Linux, Arch::Arm64)),
      ..Default::default()
    };
    let orch = orchestrator(&dir, registry.clone(), executor);

    let report = orch.run(released("v2.0.0"), &creds(), &CancellationToken::new()).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.failure, Some(FailureKind::PartialTargets));
    assert!(report.history.iter().all(|t| t.to != RunState::AllTargetsReady));
    assert!(registry.writes().await.is_empty());
    assert_eq!(report.targets.len(), 2);
  }

  #[tokio::test]
  async fn rejected_tag_fails_while_publishing() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io").reject_manifest("v2.0.0"));
    let orch = orchestrator(&dir, registry.clone(), FakeExecutor::default());

    let report = orch.run(released("v2.0.0"), &creds(), &CancellationToken::new()).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.failure, Some(FailureKind::Publish));
    let states: Vec<RunState> = report.history.iter().map(|t| t.to).collect();
    assert_eq!(
      states,
      [
        RunState::Triggered,
        RunState::Authenticated,
        RunState::Building,
        RunState::AllTargetsReady,
        RunState::Publishing,
        RunState::Failed
      ]
    );
    assert!(report.index_digest.is_none());
    let session = registry.authenticate("criteo/netprobify", &creds()).await.unwrap();
    assert!(registry.resolve(&session, "v2.0.0").await.unwrap().is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn token_expiring_during_build_is_renewed_before_publish() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io").with_token_lifetime(Duration::from_secs(300)));
    let executor = FakeExecutor {
      delay: Some(Duration::from_secs(400)),
      ..Default::default()
    };
    let orch = orchestrator(&dir, registry.clone(), executor);

    let report = orch.run(released("v2.0.0"), &creds(), &CancellationToken::new()).await;

    assert_eq!(report.state, RunState::Published, "{:?}", report.error);
    assert_eq!(registry.sessions_issued(), 2);
    assert!(registry.manifest("criteo/netprobify", "v2.0.0").await.is_some());
  }

  #[tokio::test]
  async fn published_image_starts_from_base_layers() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io"));
    let orch = orchestrator(&dir, registry.clone(), FakeExecutor::default());

    let report = orch.run(released("v2.0.0"), &creds(), &CancellationToken::new()).await;
    assert!(report.is_published(), "{:?}", report.error);

    let stored = registry.manifest("criteo/netprobify", "v2.0.0").await.unwrap();
    let index: ImageIndex = serde_json::from_slice(&stored.body).unwrap();
    for entry in &index.manifests {
      let manifest = registry
        .manifest("criteo/netprobify", entry.digest.as_str())
        .await
        .unwrap();
      let manifest: crate::oci::ImageManifest = serde_json::from_slice(&manifest.body).unwrap();
      // one base layer below the recipe's six
      assert_eq!(manifest.layers.len(), 7);
      for layer in &manifest.layers {
        assert!(registry.blob(&layer.digest).await.is_some());
      }
    }
  }

  #[tokio::test]
  async fn rejected_credentials_fail_before_building() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io").with_credentials("ci-bot", "other"));
    let executor = FakeExecutor::default();
    let orch = orchestrator(&dir, registry.clone(), executor);

    let report = orch.run(released("v2.0.0"), &creds(), &CancellationToken::new()).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.failure, Some(FailureKind::Auth));
    assert!(report.targets.is_empty());
  }

  #[tokio::test]
  async fn invalid_release_name_fails_before_auth() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io"));
    let orch = orchestrator(&dir, registry.clone(), FakeExecutor::default());

    let report = orch.run(released("release/2.0"), &creds(), &CancellationToken::new()).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.failure, Some(FailureKind::Tag));
    assert_eq!(report.history.len(), 2);
    assert!(report.tag.is_none());
  }

  #[tokio::test]
  async fn rerun_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io"));
    let orch = orchestrator(&dir, registry.clone(), FakeExecutor::default());

    let first = orch.run(released("v2.0.0"), &creds(), &CancellationToken::new()).await;
    let second = orch.run(released("v2.0.0"), &creds(), &CancellationToken::new()).await;

    assert!(first.is_published() && second.is_published());
    assert_eq!(first.index_digest, second.index_digest);
    assert_eq!(second.blobs_pushed, 0);
    assert_eq!(second.cache_misses(), 0);
  }

  #[tokio::test]
  async fn cancelled_run_leaves_registry_untouched() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io"));
    let orch = orchestrator(&dir, registry.clone(), FakeExecutor::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = orch.run(released("v2.0.0"), &creds(), &cancel).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.failure, Some(FailureKind::Cancelled));
    assert!(registry.writes().await.is_empty());
  }

  #[tokio::test]
  async fn plan_lists_reference_and_instructions() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io"));
    let orch = orchestrator(&dir, registry, FakeExecutor::default());

    let event = ReleaseEvent::ManualDispatch {
      git_ref: Some("main".to_string()),
      sha: Some("3f9a1c0d2e".to_string()),
    };
    let plan = orch.plan(&event).unwrap();
    assert_eq!(plan.reference.to_string(), "ghcr.io/criteo/netprobify:sha-3f9a1c0");
    assert_eq!(plan.platforms.len(), 2);
    assert_eq!(plan.instructions.len(), ImageRecipe::netprobify().instructions().len());
  }

  #[tokio::test]
  #[traced_test]
  async fn credentials_never_reach_logs_or_report() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io"));
    let orch = orchestrator(&dir, registry, FakeExecutor::default());

    let report = orch.run(released("v2.0.0"), &creds(), &CancellationToken::new()).await;

    assert!(report.is_published());
    assert!(logs_contain("published"));
    assert!(!logs_contain("ghp_do_not_log_me"));
    assert!(!report.to_json().unwrap().contains("ghp_do_not_log_me"));
  }

  #[tokio::test]
  async fn duplicate_platforms_are_collapsed() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new("ghcr.io"));
    let mut orch = orchestrator(&dir, registry.clone(), FakeExecutor::default());
    orch = Orchestrator::new(
      registry.clone(),
      orch.inputs.clone(),
      ReleaseSettings {
        platforms: vec![
          Platform::new(Os::Linux, Arch::Amd64),
          Platform::new(Os::Linux, Arch::Amd64),
        ],
        ..orch.settings.clone()
      },
    );

    let report = orch.run(released("v1"), &creds(), &CancellationToken::new()).await;
    assert!(report.is_published());
    let stored = registry.manifest("criteo/netprobify", "v1").await.unwrap();
    let index: ImageIndex = serde_json::from_slice(&stored.body).unwrap();
    assert_eq!(index.manifests.len(), 1);
    assert!(matches!(registry.writes().await.last(), Some(Upload::Manifest { reference, .. }) if reference == "v1"));
  }
}
