//! Layer cache behavior across builds of a changing context.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use probeship_lib::build::{ImageArtifact, LayoutBase, StepStatus, build_image};
use probeship_lib::cache::{CacheMode, FsCache, LayerCache, RegistryCache, TieredCache};
use probeship_lib::recipe::ImageRecipe;
use probeship_lib::registry::MemoryRegistry;
use probeship_lib::release::ReleaseEvent;
use probeship_lib::secret::Credentials;
use tempfile::TempDir;

use super::common::{
  FakeExecutor, Harness, REPOSITORY, TOKEN, amd64, arm64, open_context, resolve_base, write_base, write_context,
};

async fn build(
  context_dir: &TempDir,
  base: &LayoutBase,
  cache: &dyn LayerCache,
  executor: &FakeExecutor,
  mode: CacheMode,
) -> ImageArtifact {
  let resolved = resolve_base(base, &amd64()).await;
  build_image(
    &ImageRecipe::netprobify(),
    &open_context(context_dir.path()),
    &amd64(),
    &resolved,
    base,
    cache,
    executor,
    mode,
  )
  .await
  .unwrap()
}

fn status_of<'a>(image: &'a ImageArtifact, prefix: &str) -> &'a StepStatus {
  &image
    .steps
    .iter()
    .find(|s| s.instruction.starts_with(prefix))
    .unwrap_or_else(|| panic!("no step starting with {}", prefix))
    .status
}

#[tokio::test]
async fn source_edit_keeps_dependency_layers_cached() {
  let context_dir = TempDir::new().unwrap();
  let cache_dir = TempDir::new().unwrap();
  let base_dir = TempDir::new().unwrap();
  write_context(context_dir.path());
  let base = write_base(base_dir.path());
  let cache = FsCache::new(cache_dir.path());
  let executor = FakeExecutor::default();

  let first = build(&context_dir, &base, &cache, &executor, CacheMode::Max).await;
  assert_eq!(first.cache_hits(), 0);

  std::fs::write(context_dir.path().join("netprobify/main.py"), "def main():\n    return 1\n").unwrap();

  let second = build(&context_dir, &base, &cache, &executor, CacheMode::Max).await;

  let pip_first = first.steps.iter().find(|s| s.instruction.starts_with("RUN pip")).unwrap();
  let pip_second = second.steps.iter().find(|s| s.instruction.starts_with("RUN pip")).unwrap();
  assert_eq!(pip_first.key, pip_second.key);

  assert_eq!(*status_of(&second, "RUN apt-get"), StepStatus::Cached);
  assert_eq!(*status_of(&second, "COPY requirements.txt"), StepStatus::Cached);
  assert_eq!(*status_of(&second, "RUN pip"), StepStatus::Cached);
  assert_eq!(*status_of(&second, "COPY netprobify "), StepStatus::Built);
  assert_ne!(first.manifest_digest(), second.manifest_digest());
}

#[tokio::test]
async fn dependency_change_invalidates_install_and_later_layers() {
  let context_dir = TempDir::new().unwrap();
  let cache_dir = TempDir::new().unwrap();
  let base_dir = TempDir::new().unwrap();
  write_context(context_dir.path());
  let base = write_base(base_dir.path());
  let cache = FsCache::new(cache_dir.path());
  let executor = FakeExecutor::default();

  build(&context_dir, &base, &cache, &executor, CacheMode::Max).await;

  std::fs::write(context_dir.path().join("requirements.txt"), "scapy==2.6.0\n").unwrap();
  let rebuilt = build(&context_dir, &base, &cache, &executor, CacheMode::Max).await;

  assert_eq!(*status_of(&rebuilt, "RUN apt-get"), StepStatus::Cached);
  assert_eq!(*status_of(&rebuilt, "RUN pip"), StepStatus::Built);
  assert_eq!(*status_of(&rebuilt, "COPY netprobify "), StepStatus::Built);
}

#[tokio::test]
async fn min_mode_only_reuses_the_final_layer() {
  let context_dir = TempDir::new().unwrap();
  let cache_dir = TempDir::new().unwrap();
  let base_dir = TempDir::new().unwrap();
  write_context(context_dir.path());
  let base = write_base(base_dir.path());
  let cache = FsCache::new(cache_dir.path());
  let executor = FakeExecutor::default();

  build(&context_dir, &base, &cache, &executor, CacheMode::Min).await;
  assert_eq!(cache.stats().unwrap().entries, 1);

  let again = build(&context_dir, &base, &cache, &executor, CacheMode::Min).await;
  assert_eq!(again.cache_hits(), 1);
}

fn shared_cache(registry: &Arc<MemoryRegistry>, dir: &TempDir) -> Arc<dyn LayerCache> {
  Arc::new(TieredCache::new(
    FsCache::new(dir.path()),
    RegistryCache::new(
      registry.clone(),
      &RegistryCache::repository_for(REPOSITORY),
      Credentials::new("ci-bot", TOKEN),
    ),
  ))
}

#[tokio::test]
async fn registry_cache_is_shared_between_builders() {
  let registry = Arc::new(MemoryRegistry::new("ghcr.io").with_credentials("ci-bot", TOKEN));
  let first_dir = TempDir::new().unwrap();
  let second_dir = TempDir::new().unwrap();
  let credentials = Credentials::new("ci-bot", TOKEN);

  let first = Harness::with(FakeExecutor::default(), registry.clone(), shared_cache(&registry, &first_dir));
  let report = first
    .orchestrator(vec![amd64(), arm64()])
    .run(
      ReleaseEvent::Released {
        ref_name: "v2.0.0".to_string(),
      },
      &credentials,
      &CancellationToken::new(),
    )
    .await;
  assert!(report.is_published(), "{:?}", report.error);
  assert!(first.executor.run_count() > 0);

  // a second builder with an empty local cache
  let second = Harness::with(FakeExecutor::default(), registry.clone(), shared_cache(&registry, &second_dir));
  let report = second
    .orchestrator(vec![amd64(), arm64()])
    .run(
      ReleaseEvent::Released {
        ref_name: "v2.0.1".to_string(),
      },
      &credentials,
      &CancellationToken::new(),
    )
    .await;

  assert!(report.is_published(), "{:?}", report.error);
  assert_eq!(second.executor.run_count(), 0);
  assert_eq!(report.cache_misses(), 0);
  // remote hits were copied into the second builder's directory
  assert_eq!(FsCache::new(second_dir.path()).stats().unwrap().entries, 12);
  assert!(
    registry
      .writes()
      .await
      .iter()
      .any(|w| matches!(w, probeship_lib::registry::memory::Upload::Manifest { reference, .. } if reference.starts_with("layer-")))
  );
}
