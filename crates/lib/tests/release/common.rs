//! Shared fixtures: a netprobify build context on disk, a python base image in
//! an OCI layout, and an executor that fakes `RUN` steps.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use probeship_lib::build::layer::pack_tree;
use probeship_lib::build::{
  BaseSource, BuildError, LayoutBase, ProcessExecutor, ResolvedBase, StepExecutor, StepRequest,
};
use probeship_lib::cache::{CachedLayer, LayerCache, MemoryCache};
use probeship_lib::context::{BuildContext, ContextLayout};
use probeship_lib::execute::{ExecuteConfig, SharedInputs};
use probeship_lib::oci::layout::OciLayout;
use probeship_lib::oci::{
  Blob, ContainerConfig, ImageConfig, ImageIndex, ImageManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX,
  MEDIA_TYPE_MANIFEST, PlatformSpec,
};
use probeship_lib::platform::Platform;
use probeship_lib::platform::arch::Arch;
use probeship_lib::platform::os::Os;
use probeship_lib::recipe::{BaseImage, ImageRecipe, Instruction};
use probeship_lib::registry::MemoryRegistry;
use probeship_lib::release::{ManualTagPolicy, Orchestrator, ReleaseSettings};

pub const REPOSITORY: &str = "criteo/netprobify";
pub const TOKEN: &str = "ghp_integration_secret";
pub const BASE_TAG: &str = "3.11.9-slim-bookworm";

pub fn amd64() -> Platform {
  Platform::new(Os::Linux, Arch::Amd64)
}

pub fn arm64() -> Platform {
  Platform::new(Os::Linux, Arch::Arm64)
}

/// Write a netprobify source tree into `root`.
pub fn write_context(root: &Path) {
  std::fs::create_dir_all(root.join("netprobify")).unwrap();
  std::fs::write(root.join("requirements.txt"), "scapy==2.5.0\npyyaml==6.0.1\n").unwrap();
  std::fs::write(root.join("netprobify/__init__.py"), "").unwrap();
  std::fs::write(root.join("netprobify/main.py"), "def main():\n    pass\n").unwrap();
  std::fs::write(root.join("netprobify_start.py"), "from netprobify.main import main\nmain()\n").unwrap();
  std::fs::write(root.join("VERSION"), "2.0.0\n").unwrap();
}

pub fn open_context(root: &Path) -> BuildContext {
  let mut context = BuildContext::open(root, ContextLayout::default()).unwrap();
  context.prepare(&ImageRecipe::netprobify()).unwrap();
  context
}

/// Write a one-layer `python:3.11.9-slim-bookworm` for amd64 and arm64 into an
/// OCI layout at `root`.
pub fn write_base(root: &Path) -> LayoutBase {
  let layout = OciLayout::create(root).unwrap();
  let mut entries = Vec::new();
  for platform in [amd64(), arm64()] {
    let tree = TempDir::new().unwrap();
    std::fs::create_dir_all(tree.path().join("usr/local/bin")).unwrap();
    std::fs::write(tree.path().join("usr/local/bin/python3"), format!("python for {}\n", platform)).unwrap();
    let layer = pack_tree(tree.path()).unwrap();
    layout.write_blob(&layer.data).unwrap();

    let container = ContainerConfig {
      env: vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string(), "PYTHON_VERSION=3.11.9".to_string()],
      cmd: vec!["python3".to_string()],
      ..Default::default()
    };
    let config = Blob::from_json(
      MEDIA_TYPE_CONFIG,
      &ImageConfig::new(&platform, container, vec![layer.diff_id.clone()]),
    )
    .unwrap();
    layout.write_blob(&config.data).unwrap();
    let manifest = Blob::from_json(
      MEDIA_TYPE_MANIFEST,
      &ImageManifest::new(config.descriptor, vec![layer.descriptor]),
    )
    .unwrap();
    layout.write_blob(&manifest.data).unwrap();

    let mut entry = manifest.descriptor;
    entry.platform = Some(PlatformSpec::from(&platform));
    entries.push(entry);
  }
  let index = Blob::from_json(MEDIA_TYPE_INDEX, &ImageIndex::new(entries)).unwrap();
  layout.write_blob(&index.data).unwrap();
  layout.tag(BASE_TAG, index.descriptor).unwrap();
  LayoutBase::open(root).unwrap()
}

pub async fn resolve_base(source: &LayoutBase, platform: &Platform) -> ResolvedBase {
  let python: BaseImage = format!("python:{}", BASE_TAG).parse().unwrap();
  source.resolve(&python, platform).await.unwrap()
}

/// Executes `COPY` for real and fakes `RUN` with a layer holding the command
/// text. `RUN` fails for platforms in `fail_on`.
#[derive(Default)]
pub struct FakeExecutor {
  pub fail_on: HashSet<Platform>,
  pub runs: Mutex<Vec<(Platform, String)>>,
  copy: ProcessExecutor,
}

impl FakeExecutor {
  pub fn failing(platform: Platform) -> Self {
    Self {
      fail_on: HashSet::from([platform]),
      ..Default::default()
    }
  }

  pub fn run_count(&self) -> usize {
    self.runs.lock().unwrap().len()
  }
}

#[async_trait]
impl StepExecutor for FakeExecutor {
  async fn execute(&self, request: StepRequest<'_>) -> Result<CachedLayer, BuildError> {
    let Instruction::Run { command } = request.instruction else {
      return self.copy.execute(request).await;
    };
    if self.fail_on.contains(request.platform) {
      return Err(BuildError::CmdFailed {
        platform: request.platform.clone(),
        command: command.clone(),
        code: Some(100),
      });
    }
    self
      .runs
      .lock()
      .unwrap()
      .push((request.platform.clone(), command.clone()));

    let rootfs = TempDir::new().unwrap();
    std::fs::write(rootfs.path().join("step"), format!("{}\n{}\n", request.platform, command)).unwrap();
    Ok(pack_tree(rootfs.path()).unwrap())
  }
}

/// Everything a release test needs, kept alive together.
pub struct Harness {
  pub dir: TempDir,
  pub registry: Arc<MemoryRegistry>,
  pub executor: Arc<FakeExecutor>,
  pub cache: Arc<dyn LayerCache>,
  pub base: Arc<LayoutBase>,
  _base_dir: TempDir,
}

impl Harness {
  pub fn new(executor: FakeExecutor) -> Self {
    Self::with(
      executor,
      Arc::new(MemoryRegistry::new("ghcr.io").with_credentials("ci-bot", TOKEN)),
      Arc::new(MemoryCache::new()),
    )
  }

  /// A harness publishing to `registry` and caching in `cache`.
  pub fn with(executor: FakeExecutor, registry: Arc<MemoryRegistry>, cache: Arc<dyn LayerCache>) -> Self {
    let dir = TempDir::new().unwrap();
    write_context(dir.path());
    let base_dir = TempDir::new().unwrap();
    let base = Arc::new(write_base(base_dir.path()));
    Self {
      dir,
      registry,
      executor: Arc::new(executor),
      cache,
      base,
      _base_dir: base_dir,
    }
  }

  pub fn orchestrator(&self, platforms: Vec<Platform>) -> Orchestrator {
    let inputs = SharedInputs {
      recipe: Arc::new(ImageRecipe::netprobify()),
      context: Arc::new(open_context(self.dir.path())),
      base: self.base.clone(),
      cache: self.cache.clone(),
      executor: self.executor.clone(),
    };
    Orchestrator::new(
      self.registry.clone(),
      inputs,
      ReleaseSettings {
        repository: REPOSITORY.to_string(),
        platforms,
        manual_tag: ManualTagPolicy::default(),
        execute: ExecuteConfig::default(),
      },
    )
  }
}
