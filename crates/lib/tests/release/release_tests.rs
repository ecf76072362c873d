//! Release runs end to end: trigger, build, publish.

use tokio_util::sync::CancellationToken;

use probeship_lib::oci::{ImageIndex, ImageManifest, MEDIA_TYPE_INDEX};
use probeship_lib::registry::memory::Upload;
use probeship_lib::release::{FailureKind, ReleaseEvent, RunState};
use probeship_lib::secret::Credentials;

use super::common::{FakeExecutor, Harness, REPOSITORY, TOKEN, amd64, arm64};

fn released(tag: &str) -> ReleaseEvent {
  ReleaseEvent::Released {
    ref_name: tag.to_string(),
  }
}

fn credentials() -> Credentials {
  Credentials::new("ci-bot", TOKEN)
}

#[tokio::test]
async fn released_event_publishes_both_platforms() {
  let harness = Harness::new(FakeExecutor::default());
  let orchestrator = harness.orchestrator(vec![amd64(), arm64()]);

  let report = orchestrator
    .run(released("v2.0.0"), &credentials(), &CancellationToken::new())
    .await;

  assert_eq!(report.state, RunState::Published, "{:?}", report.error);
  assert_eq!(report.reference.as_deref(), Some("ghcr.io/criteo/netprobify:v2.0.0"));

  let stored = harness.registry.manifest(REPOSITORY, "v2.0.0").await.unwrap();
  assert_eq!(stored.media_type, MEDIA_TYPE_INDEX);
  let index: ImageIndex = serde_json::from_slice(&stored.body).unwrap();
  let archs: Vec<&str> = index.platforms().iter().map(|p| p.architecture.as_str()).collect();
  assert_eq!(archs, ["amd64", "arm64"]);

  // every platform manifest and its blobs are retrievable by digest
  for entry in &index.manifests {
    let manifest = harness
      .registry
      .manifest(REPOSITORY, entry.digest.as_str())
      .await
      .unwrap();
    let manifest: ImageManifest = serde_json::from_slice(&manifest.body).unwrap();
    // the base layer, then the recipe's six
    assert_eq!(manifest.layers.len(), 7);
    assert!(harness.registry.blob(&manifest.config.digest).await.is_some());
    for layer in &manifest.layers {
      assert!(harness.registry.blob(&layer.digest).await.is_some());
    }
  }
}

#[tokio::test]
async fn one_platform_failing_leaves_tag_absent() {
  let harness = Harness::new(FakeExecutor::failing(arm64()));
  let orchestrator = harness.orchestrator(vec![amd64(), arm64()]);

  let report = orchestrator
    .run(released("v2.0.0"), &credentials(), &CancellationToken::new())
    .await;

  assert_eq!(report.state, RunState::Failed);
  assert_eq!(report.failure, Some(FailureKind::PartialTargets));
  assert!(report.error.as_deref().unwrap().contains("linux/arm64"));
  assert!(harness.registry.manifest(REPOSITORY, "v2.0.0").await.is_none());
  assert!(harness.registry.writes().await.is_empty());
}

#[tokio::test]
async fn rerunning_the_same_release_is_idempotent() {
  let harness = Harness::new(FakeExecutor::default());
  let orchestrator = harness.orchestrator(vec![amd64(), arm64()]);

  let first = orchestrator
    .run(released("v2.0.0"), &credentials(), &CancellationToken::new())
    .await;
  let runs_after_first = harness.executor.run_count();
  let second = orchestrator
    .run(released("v2.0.0"), &credentials(), &CancellationToken::new())
    .await;

  assert!(first.is_published() && second.is_published());
  assert_eq!(first.index_digest, second.index_digest);
  assert_eq!(harness.executor.run_count(), runs_after_first);
  assert_eq!(second.cache_misses(), 0);
  assert_eq!(second.blobs_pushed, 0);
}

#[tokio::test]
async fn rebuild_from_a_fresh_cache_yields_the_same_index() {
  let first = Harness::new(FakeExecutor::default());
  let second = Harness::new(FakeExecutor::default());

  let a = first
    .orchestrator(vec![amd64(), arm64()])
    .run(released("v2.0.0"), &credentials(), &CancellationToken::new())
    .await;
  let b = second
    .orchestrator(vec![amd64(), arm64()])
    .run(released("v2.0.0"), &credentials(), &CancellationToken::new())
    .await;

  assert!(a.is_published() && b.is_published());
  assert_eq!(a.index_digest, b.index_digest);
}

#[tokio::test]
async fn release_name_is_the_tag() {
  let harness = Harness::new(FakeExecutor::default());
  let orchestrator = harness.orchestrator(vec![amd64()]);

  let report = orchestrator
    .run(released("v1.2.3"), &credentials(), &CancellationToken::new())
    .await;

  assert_eq!(report.tag.as_deref(), Some("v1.2.3"));
  let tags: Vec<String> = harness
    .registry
    .writes()
    .await
    .into_iter()
    .filter_map(|w| match w {
      Upload::Manifest { reference, .. } if !reference.starts_with("sha256:") => Some(reference),
      _ => None,
    })
    .collect();
  assert_eq!(tags, ["v1.2.3"]);
}

#[tokio::test]
async fn bad_credentials_fail_before_any_build() {
  let harness = Harness::new(FakeExecutor::default());
  let orchestrator = harness.orchestrator(vec![amd64(), arm64()]);

  let report = orchestrator
    .run(
      released("v2.0.0"),
      &Credentials::new("ci-bot", "wrong"),
      &CancellationToken::new(),
    )
    .await;

  assert_eq!(report.state, RunState::Failed);
  assert_eq!(report.failure, Some(FailureKind::Auth));
  assert_eq!(harness.executor.run_count(), 0);
}

#[tokio::test]
async fn manual_dispatch_is_tagged_by_commit() {
  let harness = Harness::new(FakeExecutor::default());
  let orchestrator = harness.orchestrator(vec![amd64()]);

  let report = orchestrator
    .run(
      ReleaseEvent::ManualDispatch {
        git_ref: Some("main".to_string()),
        sha: Some("0123456789abcdef0123456789abcdef01234567".to_string()),
      },
      &credentials(),
      &CancellationToken::new(),
    )
    .await;

  assert!(report.is_published(), "{:?}", report.error);
  assert!(harness.registry.manifest(REPOSITORY, "sha-0123456").await.is_some());
}

#[tokio::test]
async fn report_never_contains_the_token() {
  let harness = Harness::new(FakeExecutor::failing(amd64()));
  let failed = harness
    .orchestrator(vec![amd64(), arm64()])
    .run(released("v2.0.0"), &credentials(), &CancellationToken::new())
    .await;

  let ok = Harness::new(FakeExecutor::default());
  let published = ok
    .orchestrator(vec![amd64(), arm64()])
    .run(released("v2.0.0"), &credentials(), &CancellationToken::new())
    .await;

  for report in [failed, published] {
    let path = harness.dir.path().join("report.json");
    report.write(&path).unwrap();
    assert!(!std::fs::read_to_string(&path).unwrap().contains(TOKEN));
  }
}
