//! Wiring shared by the commands: configuration, build inputs, triggers and
//! Ctrl-C handling.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use probeship_lib::build::{BaseSource, LayoutBase, ProcessExecutor, RegistryBase};
use probeship_lib::cache::{FsCache, LayerCache, RegistryCache, TieredCache};
use probeship_lib::config::{CacheBackend, ReleaseConfig};
use probeship_lib::context::BuildContext;
use probeship_lib::execute::SharedInputs;
use probeship_lib::platform::paths;
use probeship_lib::registry::HttpRegistry;
use probeship_lib::release::ReleaseEvent;
use probeship_lib::secret::Credentials;

use crate::TriggerArgs;

pub fn load_config(path: Option<&Path>) -> Result<ReleaseConfig> {
  let path = path.map(Path::to_path_buf).unwrap_or_else(paths::config_file);
  ReleaseConfig::load(&path).with_context(|| format!("Failed to load config: {}", path.display()))
}

/// Open and hash the build context and assemble everything a build needs.
///
/// `credentials` unlock the shared registry cache; without them builds use the
/// local cache only.
pub fn shared_inputs(config: &ReleaseConfig, credentials: Option<&Credentials>) -> Result<SharedInputs> {
  let recipe = config.recipe();
  let context_dir = config.context_dir();
  let mut context = BuildContext::open(&context_dir, config.build.layout.clone())
    .with_context(|| format!("Failed to open build context: {}", context_dir.display()))?;
  context.prepare(&recipe).context("Build context does not match the recipe")?;

  Ok(SharedInputs {
    recipe: Arc::new(recipe),
    context: Arc::new(context),
    base: base_source(config)?,
    cache: layer_cache(config, credentials)?,
    executor: Arc::new(ProcessExecutor::new(config.build.process.clone())),
  })
}

/// The configured base layout, or the registry the base reference names.
fn base_source(config: &ReleaseConfig) -> Result<Arc<dyn BaseSource>> {
  if let Some(dir) = config.base_layout() {
    let layout =
      LayoutBase::open(&dir).with_context(|| format!("Failed to open base image layout: {}", dir.display()))?;
    return Ok(Arc::new(layout));
  }
  let host = match &config.base.mirror {
    Some(mirror) => mirror.clone(),
    None => config.recipe().base.location().0,
  };
  let registry = HttpRegistry::new(&host, config.base.insecure)
    .with_context(|| format!("Failed to create registry client for {}", host))?;
  Ok(Arc::new(RegistryBase::new(Arc::new(registry))))
}

fn layer_cache(config: &ReleaseConfig, credentials: Option<&Credentials>) -> Result<Arc<dyn LayerCache>> {
  let local = FsCache::new(config.cache_dir());
  match (config.cache.backend, credentials) {
    (CacheBackend::Local, _) => Ok(Arc::new(local)),
    (CacheBackend::Registry, None) => {
      warn!("no registry credentials, using the local layer cache only");
      Ok(Arc::new(local))
    }
    (CacheBackend::Registry, Some(credentials)) => {
      let registry = HttpRegistry::new(&config.registry.host, config.registry.insecure)
        .context("Failed to create registry client")?;
      let repository = config.cache_repository();
      info!(repository = %repository, "sharing layers through the registry cache");
      let remote = RegistryCache::new(Arc::new(registry), &repository, credentials.clone());
      Ok(Arc::new(TieredCache::new(local, remote)))
    }
  }
}

impl TriggerArgs {
  pub fn event(&self) -> Result<ReleaseEvent> {
    if let Some(ref_name) = &self.ref_name {
      return Ok(ReleaseEvent::Released {
        ref_name: ref_name.clone(),
      });
    }
    if self.manual {
      return Ok(ReleaseEvent::ManualDispatch {
        git_ref: self.branch.clone(),
        sha: self.sha.clone(),
      });
    }
    ReleaseEvent::from_github_env().context("No trigger given: pass --ref or --manual, or run under GitHub Actions")
  }
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}

/// A token cancelled on Ctrl-C or once `timeout` elapses. Must be called
/// inside the runtime.
pub fn cancellation(timeout: Option<Duration>) -> CancellationToken {
  let cancel = CancellationToken::new();

  let on_signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted, finishing running steps");
      on_signal.cancel();
    }
  });

  if let Some(timeout) = timeout {
    let on_timeout = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(timeout).await;
      warn!(timeout = %humantime::format_duration(timeout), "timed out");
      on_timeout.cancel();
    });
  }

  cancel
}
