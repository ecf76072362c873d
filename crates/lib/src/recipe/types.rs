use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tags that name a moving target rather than an exact release.
const FLOATING_TAGS: &[&str] = &["latest", "stable", "edge", "current"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecipeError {
  #[error("base image '{0}' is not pinned: use an exact version tag or a digest")]
  FloatingBase(String),

  #[error("invalid base image reference '{0}'")]
  InvalidBase(String),

  #[error("recipe has no dependencies step")]
  MissingDependencies,

  #[error("recipe has more than one dependencies step")]
  DuplicateDependencies,

  #[error("step {index} copies '{path}' before dependencies are installed")]
  SourceBeforeDependencies { index: usize, path: String },

  #[error("step {index} installs system packages after language dependencies")]
  SystemPackagesAfterDependencies { index: usize },

  #[error("step {index} has an empty package list")]
  EmptyPackages { index: usize },

  #[error("recipe must end with exactly one cmd step")]
  MissingCmd,

  #[error("cmd step {index} is not the last step")]
  CmdNotLast { index: usize },

  #[error("cmd step has an empty argv")]
  EmptyCmd,

  #[error("path '{path}' in step {index} must be relative to the build context and stay inside it")]
  PathEscapesContext { index: usize, path: String },

  #[error("in-image path '{path}' in step {index} must be absolute")]
  RelativeImagePath { index: usize, path: String },

  #[error("runtime config path '{0}' must be absolute")]
  RelativeConfigPath(String),
}

/// A base image reference, pinned by tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BaseImage {
  pub name: String,
  pub tag: Option<String>,
  pub digest: Option<String>,
}

/// Registry that serves unqualified image names.
pub const DEFAULT_REGISTRY: &str = "docker.io";

impl BaseImage {
  /// Registry host and repository the image is pulled from. Names without a
  /// registry component live on Docker Hub, official images under `library/`.
  pub fn location(&self) -> (String, String) {
    if let Some((first, rest)) = self.name.split_once('/')
      && (first.contains('.') || first.contains(':') || first == "localhost")
    {
      return (first.to_string(), rest.to_string());
    }
    let repository = if self.name.contains('/') {
      self.name.clone()
    } else {
      format!("library/{}", self.name)
    };
    (DEFAULT_REGISTRY.to_string(), repository)
  }

  /// The manifest reference to pull: the digest when pinned, else the tag.
  pub fn reference(&self) -> &str {
    self
      .digest
      .as_deref()
      .or(self.tag.as_deref())
      .unwrap_or("latest")
  }

  /// Reject references that do not pin an exact image.
  pub fn ensure_pinned(&self) -> Result<(), RecipeError> {
    if self.digest.is_some() {
      return Ok(());
    }
    match self.tag.as_deref() {
      Some(tag) if !FLOATING_TAGS.contains(&tag) => Ok(()),
      _ => Err(RecipeError::FloatingBase(self.to_string())),
    }
  }
}

impl fmt::Display for BaseImage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name)?;
    if let Some(tag) = &self.tag {
      write!(f, ":{}", tag)?;
    }
    if let Some(digest) = &self.digest {
      write!(f, "@{}", digest)?;
    }
    Ok(())
  }
}

impl FromStr for BaseImage {
  type Err = RecipeError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || RecipeError::InvalidBase(s.to_string());
    if s.is_empty() || s.chars().any(char::is_whitespace) {
      return Err(invalid());
    }

    let (rest, digest) = match s.split_once('@') {
      Some((rest, digest)) if digest.starts_with("sha256:") && digest.len() == 71 => (rest, Some(digest.to_string())),
      Some(_) => return Err(invalid()),
      None => (s, None),
    };

    // A colon after the last slash separates the tag; earlier colons belong to a registry port.
    let last_segment_start = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match rest[last_segment_start..].rfind(':') {
      Some(offset) => {
        let split = last_segment_start + offset;
        let tag = &rest[split + 1..];
        if tag.is_empty() {
          return Err(invalid());
        }
        (&rest[..split], Some(tag.to_string()))
      }
      None => (rest, None),
    };

    if name.is_empty() {
      return Err(invalid());
    }

    Ok(Self {
      name: name.to_string(),
      tag,
      digest,
    })
  }
}

impl TryFrom<String> for BaseImage {
  type Error = RecipeError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<BaseImage> for String {
  fn from(base: BaseImage) -> Self {
    base.to_string()
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
  #[default]
  Apt,
  Apk,
}

impl PackageManager {
  /// Install command for `packages`, including cache cleanup in the same layer.
  pub fn install_command(&self, packages: &[String]) -> String {
    let list = packages.join(" ");
    match self {
      Self::Apt => format!(
        "apt-get update && apt-get install -y --no-install-recommends {} && apt-get clean && rm -rf /var/lib/apt/lists/*",
        list
      ),
      Self::Apk => format!("apk add --no-cache {}", list),
    }
  }
}

/// One step of an image recipe, in authoring form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Step {
  /// OS-level runtime dependencies.
  SystemPackages {
    packages: Vec<String>,
    #[serde(default)]
    manager: PackageManager,
  },
  /// Stage the dependency manifest alone, then install from it.
  Dependencies {
    manifest: String,
    dest: String,
    install: String,
  },
  /// Copy a context path into the image.
  Copy { source: String, dest: String },
  Workdir { path: String },
  Env { vars: BTreeMap<String, String> },
  Label { labels: BTreeMap<String, String> },
  /// Default command, exec form.
  Cmd { argv: Vec<String> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
  #[default]
  Host,
  Bridge,
}

impl NetworkMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Host => "host",
      Self::Bridge => "bridge",
    }
  }
}

/// What the running container expects from whoever starts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeContract {
  /// In-image path where the configuration file is mounted.
  pub config_path: String,
  #[serde(default)]
  pub network: NetworkMode,
}

/// An ordered image build recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecipe {
  pub base: BaseImage,
  pub steps: Vec<Step>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub runtime: Option<RuntimeContract>,
}

impl ImageRecipe {
  /// The recipe used to package netprobify.
  pub fn netprobify() -> Self {
    let app_dir = "/opt/netprobify";
    Self {
      base: BaseImage {
        name: "python".to_string(),
        tag: Some("3.11.9-slim-bookworm".to_string()),
        digest: None,
      },
      steps: vec![
        Step::SystemPackages {
          packages: vec!["tcpdump".to_string()],
          manager: PackageManager::Apt,
        },
        Step::Dependencies {
          manifest: "requirements.txt".to_string(),
          dest: format!("{}/requirements.txt", app_dir),
          install: format!("pip install --no-cache-dir -r {}/requirements.txt", app_dir),
        },
        Step::Copy {
          source: "netprobify".to_string(),
          dest: format!("{}/netprobify", app_dir),
        },
        Step::Copy {
          source: "netprobify_start.py".to_string(),
          dest: format!("{}/netprobify_start.py", app_dir),
        },
        Step::Copy {
          source: "VERSION".to_string(),
          dest: format!("{}/VERSION", app_dir),
        },
        Step::Workdir {
          path: app_dir.to_string(),
        },
        Step::Cmd {
          argv: vec!["python3".to_string(), "netprobify_start.py".to_string()],
        },
      ],
      runtime: Some(RuntimeContract {
        config_path: format!("{}/netprobify.yaml", app_dir),
        network: NetworkMode::Host,
      }),
    }
  }

  /// Check the ordering and pinning rules.
  ///
  /// - the base image is pinned
  /// - exactly one dependencies step, preceded by any system packages step
  /// - nothing is copied from the context before the dependencies step
  /// - exactly one cmd step, and it is last
  pub fn validate(&self) -> Result<(), RecipeError> {
    self.base.ensure_pinned()?;

    let mut deps_index = None;
    let mut cmd_index = None;

    for (index, step) in self.steps.iter().enumerate() {
      match step {
        Step::SystemPackages { packages, .. } => {
          if packages.is_empty() {
            return Err(RecipeError::EmptyPackages { index });
          }
          if deps_index.is_some() {
            return Err(RecipeError::SystemPackagesAfterDependencies { index });
          }
        }
        Step::Dependencies { manifest, dest, .. } => {
          if deps_index.is_some() {
            return Err(RecipeError::DuplicateDependencies);
          }
          check_context_path(index, manifest)?;
          check_image_path(index, dest)?;
          deps_index = Some(index);
        }
        Step::Copy { source, dest } => {
          if deps_index.is_none() {
            return Err(RecipeError::SourceBeforeDependencies {
              index,
              path: source.clone(),
            });
          }
          check_context_path(index, source)?;
          check_image_path(index, dest)?;
        }
        Step::Workdir { path } => check_image_path(index, path)?,
        Step::Cmd { argv } => {
          if argv.is_empty() {
            return Err(RecipeError::EmptyCmd);
          }
          if cmd_index.is_some() {
            return Err(RecipeError::CmdNotLast { index });
          }
          cmd_index = Some(index);
        }
        Step::Env { .. } | Step::Label { .. } => {}
      }
    }

    if deps_index.is_none() {
      return Err(RecipeError::MissingDependencies);
    }

    match cmd_index {
      None => return Err(RecipeError::MissingCmd),
      Some(index) if index + 1 != self.steps.len() => return Err(RecipeError::CmdNotLast { index }),
      Some(_) => {}
    }

    if let Some(runtime) = &self.runtime
      && !runtime.config_path.starts_with('/')
    {
      return Err(RecipeError::RelativeConfigPath(runtime.config_path.clone()));
    }

    Ok(())
  }

  /// Context-relative paths read by the recipe, in step order.
  pub fn context_sources(&self) -> Vec<&str> {
    self
      .steps
      .iter()
      .filter_map(|step| match step {
        Step::Dependencies { manifest, .. } => Some(manifest.as_str()),
        Step::Copy { source, .. } => Some(source.as_str()),
        _ => None,
      })
      .collect()
  }
}

fn check_context_path(index: usize, path: &str) -> Result<(), RecipeError> {
  let escapes = Path::new(path)
    .components()
    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
  if path.is_empty() || escapes {
    return Err(RecipeError::PathEscapesContext {
      index,
      path: path.to_string(),
    });
  }
  Ok(())
}

fn check_image_path(index: usize, path: &str) -> Result<(), RecipeError> {
  if !path.starts_with('/') {
    return Err(RecipeError::RelativeImagePath {
      index,
      path: path.to_string(),
    });
  }
  Ok(())
}
