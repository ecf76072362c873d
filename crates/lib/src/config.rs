//! `release.toml`.
//!
//! ```toml
//! [registry]
//! host = "ghcr.io"
//! repository = "criteo/netprobify"
//!
//! [build]
//! platforms = ["linux/amd64", "linux/arm64"]
//!
//! [build.process]
//! wrapper = ["podman", "run", "--rm", "--platform", "{platform}", "--network", "host",
//!            "--env-host", "--workdir", "{workdir}", "--rootfs", "{rootfs}", "/bin/sh", "-c"]
//!
//! [base]
//! layout = "vendor/python-oci"
//!
//! [cache]
//! mode = "max"
//! backend = "registry"
//!
//! [release]
//! manual_tag = "short-sha"
//! ```
//!
//! Only `[registry]` is required. `[image]` replaces the built-in netprobify
//! recipe when present.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::ProcessOptions;
use crate::cache::{CacheMode, RegistryCache};
use crate::context::ContextLayout;
use crate::execute::ExecuteConfig;
use crate::platform::Platform;
use crate::platform::arch::Arch;
use crate::platform::os::Os;
use crate::platform::paths;
use crate::recipe::{ImageRecipe, RecipeError};
use crate::registry::{RegistryError, validate_repository};
use crate::release::ManualTagPolicy;
use crate::secret::{Credentials, CredentialsError};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },

  #[error("invalid configuration: {0}")]
  Invalid(String),

  #[error(transparent)]
  Repository(#[from] RegistryError),

  #[error(transparent)]
  Recipe(#[from] RecipeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
  pub host: String,
  pub repository: String,
  /// Environment variable holding the registry username.
  #[serde(default = "default_username_env")]
  pub username_env: String,
  /// Environment variable holding the registry token.
  #[serde(default = "default_token_env")]
  pub token_env: String,
  /// Talk plain HTTP (local test registries).
  #[serde(default)]
  pub insecure: bool,
}

fn default_username_env() -> String {
  "GITHUB_ACTOR".to_string()
}

fn default_token_env() -> String {
  "GITHUB_TOKEN".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
  /// Build context directory, relative to the configuration file.
  pub context: PathBuf,
  /// Target platforms, in index order.
  pub platforms: Vec<Platform>,
  /// Targets built at once. Defaults to the number of CPUs.
  pub parallelism: Option<usize>,
  pub process: ProcessOptions,
  pub layout: ContextLayout,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      context: PathBuf::from("."),
      platforms: vec![Platform::new(Os::Linux, Arch::Amd64), Platform::new(Os::Linux, Arch::Arm64)],
      parallelism: None,
      process: ProcessOptions::default(),
      layout: ContextLayout::default(),
    }
  }
}

/// Where the base image is read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
  /// OCI image layout holding the base image, relative to the configuration
  /// file. Takes precedence over any registry.
  pub layout: Option<PathBuf>,
  /// Registry host to pull the base from instead of the one its reference names.
  pub mirror: Option<String>,
  /// Talk plain HTTP to the base registry.
  pub insecure: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
  /// Local cache directory only.
  #[default]
  Local,
  /// Local directory in front of a cache repository on the publish registry.
  Registry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Layer cache root. Defaults to the XDG cache directory.
  pub dir: Option<PathBuf>,
  pub mode: CacheMode,
  pub backend: CacheBackend,
  /// Cache repository for the registry backend. Defaults to
  /// `<registry.repository>-buildcache`.
  pub repository: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseSection {
  pub manual_tag: ManualTagPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseConfig {
  pub registry: RegistryConfig,
  #[serde(default)]
  pub build: BuildConfig,
  #[serde(default)]
  pub base: BaseConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub release: ReleaseSection,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image: Option<ImageRecipe>,
  /// Directory relative paths are resolved against.
  #[serde(skip)]
  base_dir: PathBuf,
}

impl ReleaseConfig {
  /// Load and validate a configuration file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let base_dir = path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."));
    Self::parse(&content, base_dir).map_err(|err| match err {
      ConfigError::Parse { source, .. } => ConfigError::Parse {
        path: path.to_path_buf(),
        source,
      },
      other => other,
    })
  }

  /// Parse and validate configuration text. Relative paths resolve against `base_dir`.
  pub fn parse(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
    let mut config: ReleaseConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
      path: PathBuf::from("<inline>"),
      source,
    })?;
    config.base_dir = base_dir.into();
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    validate_repository(&self.registry.repository)?;
    if self.registry.host.is_empty() || self.registry.host.contains('/') {
      return Err(ConfigError::Invalid(format!(
        "registry host '{}' must be a bare host[:port]",
        self.registry.host
      )));
    }
    if self.build.platforms.is_empty() {
      return Err(ConfigError::Invalid("build.platforms is empty".to_string()));
    }
    if let Some(repository) = &self.cache.repository {
      validate_repository(repository)?;
    }
    if let Some(mirror) = &self.base.mirror
      && (mirror.is_empty() || mirror.contains('/'))
    {
      return Err(ConfigError::Invalid(format!(
        "base mirror '{}' must be a bare host[:port]",
        mirror
      )));
    }
    if self.build.parallelism == Some(0) {
      return Err(ConfigError::Invalid("build.parallelism must be at least 1".to_string()));
    }
    self.recipe().validate()?;
    Ok(())
  }

  /// The recipe to build: `[image]` if present, otherwise the built-in one.
  pub fn recipe(&self) -> ImageRecipe {
    self.image.clone().unwrap_or_else(ImageRecipe::netprobify)
  }

  pub fn context_dir(&self) -> PathBuf {
    if self.build.context.is_absolute() {
      self.build.context.clone()
    } else {
      self.base_dir.join(&self.build.context)
    }
  }

  pub fn cache_dir(&self) -> PathBuf {
    match &self.cache.dir {
      Some(dir) if dir.is_absolute() => dir.clone(),
      Some(dir) => self.base_dir.join(dir),
      None => paths::layer_cache_dir(),
    }
  }

  /// Repository the registry cache backend reads and writes.
  pub fn cache_repository(&self) -> String {
    self
      .cache
      .repository
      .clone()
      .unwrap_or_else(|| RegistryCache::repository_for(&self.registry.repository))
  }

  /// The base image layout directory, if one is configured.
  pub fn base_layout(&self) -> Option<PathBuf> {
    self.base.layout.as_ref().map(|dir| {
      if dir.is_absolute() {
        dir.clone()
      } else {
        self.base_dir.join(dir)
      }
    })
  }

  pub fn execute_config(&self) -> ExecuteConfig {
    let mut config = ExecuteConfig {
      cache_mode: self.cache.mode,
      ..ExecuteConfig::default()
    };
    if let Some(parallelism) = self.build.parallelism {
      config.parallelism = parallelism;
    }
    config
  }

  /// Registry credentials from the configured environment variables.
  pub fn credentials(&self) -> Result<Credentials, CredentialsError> {
    Credentials::from_env(&self.registry.username_env, &self.registry.token_env)
  }
}
