//! Build context: the source inputs visible to the image builder.
//!
//! The context is a directory holding three fixed inputs:
//! - the dependency manifest (`requirements.txt`)
//! - the application source tree (`netprobify/`)
//! - the version marker (`VERSION`)
//!
//! Every path a recipe reads is hashed once when the context is prepared. The
//! hashes feed the layer cache keys; they cover file contents, relative paths
//! and the executable bit, never timestamps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::recipe::{ImageRecipe, Step};
use crate::util::hash::{ContentHash, DirHashError, hash_directory, hash_file};

#[derive(Debug, Error)]
pub enum ContextError {
  #[error("build context {0} does not exist or is not a directory")]
  NotADirectory(PathBuf),

  #[error("context input '{0}' is missing")]
  MissingInput(String),

  #[error("failed to read version marker {path}: {source}")]
  ReadVersion {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("version marker {0} is empty")]
  EmptyVersion(PathBuf),

  #[error("recipe installs dependencies from '{found}' but the context manifest is '{expected}'")]
  ManifestMismatch { expected: String, found: String },

  #[error("recipe never copies '{0}' into the image")]
  NotCopied(String),

  #[error("context input '{0}' was not staged")]
  NotStaged(String),

  #[error("failed to hash '{path}': {source}")]
  Hash {
    path: String,
    #[source]
    source: DirHashError,
  },
}

/// Where the fixed inputs live, relative to the context root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextLayout {
  pub dependency_manifest: String,
  pub source: String,
  pub version_marker: String,
  /// File or directory names skipped when hashing and packing.
  pub exclude: Vec<String>,
}

impl Default for ContextLayout {
  fn default() -> Self {
    Self {
      dependency_manifest: "requirements.txt".to_string(),
      source: "netprobify".to_string(),
      version_marker: "VERSION".to_string(),
      exclude: vec!["__pycache__".to_string(), ".git".to_string()],
    }
  }
}

/// A prepared, read-only build context.
#[derive(Debug, Clone)]
pub struct BuildContext {
  root: PathBuf,
  layout: ContextLayout,
  version: String,
  hashes: BTreeMap<String, ContentHash>,
}

impl BuildContext {
  /// Open a context directory and check that the fixed inputs exist.
  pub fn open(root: impl Into<PathBuf>, layout: ContextLayout) -> Result<Self, ContextError> {
    let root = root.into();
    if !root.is_dir() {
      return Err(ContextError::NotADirectory(root));
    }

    for input in [&layout.dependency_manifest, &layout.source, &layout.version_marker] {
      if !root.join(input).exists() {
        return Err(ContextError::MissingInput(input.clone()));
      }
    }

    let marker = root.join(&layout.version_marker);
    let version = std::fs::read_to_string(&marker)
      .map_err(|source| ContextError::ReadVersion {
        path: marker.clone(),
        source,
      })?
      .trim()
      .to_string();
    if version.is_empty() {
      return Err(ContextError::EmptyVersion(marker));
    }

    Ok(Self {
      root,
      layout,
      version,
      hashes: BTreeMap::new(),
    })
  }

  /// Check the recipe against this context and hash every path it reads.
  ///
  /// The recipe must install from the context's dependency manifest and copy
  /// both the source tree and the version marker.
  pub fn prepare(&mut self, recipe: &ImageRecipe) -> Result<(), ContextError> {
    for step in &recipe.steps {
      if let Step::Dependencies { manifest, .. } = step
        && *manifest != self.layout.dependency_manifest
      {
        return Err(ContextError::ManifestMismatch {
          expected: self.layout.dependency_manifest.clone(),
          found: manifest.clone(),
        });
      }
    }

    let sources = recipe.context_sources();
    for required in [&self.layout.source, &self.layout.version_marker] {
      if !sources.iter().any(|s| s == required) {
        return Err(ContextError::NotCopied(required.clone()));
      }
    }

    for source in sources {
      if self.hashes.contains_key(source) {
        continue;
      }
      let hash = self.hash_input(source)?;
      debug!(input = %source, hash = %hash.short(12), "hashed context input");
      self.hashes.insert(source.to_string(), hash);
    }

    Ok(())
  }

  fn hash_input(&self, relative: &str) -> Result<ContentHash, ContextError> {
    let path = self.root.join(relative);
    if !path.exists() {
      return Err(ContextError::MissingInput(relative.to_string()));
    }

    let exclude: Vec<&str> = self.layout.exclude.iter().map(String::as_str).collect();
    let result = if path.is_dir() {
      hash_directory(&path, &exclude)
    } else {
      hash_file(&path)
    };
    result.map_err(|source| ContextError::Hash {
      path: relative.to_string(),
      source,
    })
  }

  /// Hash of a staged input.
  pub fn input_hash(&self, relative: &str) -> Result<&ContentHash, ContextError> {
    self
      .hashes
      .get(relative)
      .ok_or_else(|| ContextError::NotStaged(relative.to_string()))
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn layout(&self) -> &ContextLayout {
    &self.layout
  }

  /// Absolute path of a context-relative input.
  pub fn path(&self, relative: &str) -> PathBuf {
    self.root.join(relative)
  }

  /// Contents of the version marker, trimmed.
  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn excludes(&self, name: &str) -> bool {
    self.layout.exclude.iter().any(|e| e == name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn netprobify_context() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("requirements.txt"), "scapy==2.5.0\n").unwrap();
    fs::create_dir(temp.path().join("netprobify")).unwrap();
    fs::write(temp.path().join("netprobify/main.py"), "def main(): pass\n").unwrap();
    fs::write(temp.path().join("netprobify_start.py"), "import netprobify\n").unwrap();
    fs::write(temp.path().join("VERSION"), "2.0.0\n").unwrap();
    temp
  }

  #[test]
  fn open_reads_trimmed_version() {
    let temp = netprobify_context();
    let ctx = BuildContext::open(temp.path(), ContextLayout::default()).unwrap();
    assert_eq!(ctx.version(), "2.0.0");
  }

  #[test]
  fn open_requires_fixed_inputs() {
    let temp = netprobify_context();
    fs::remove_file(temp.path().join("requirements.txt")).unwrap();

    let err = BuildContext::open(temp.path(), ContextLayout::default()).unwrap_err();
    assert!(matches!(err, ContextError::MissingInput(ref p) if p == "requirements.txt"));
  }

  #[test]
  fn empty_version_marker_is_rejected() {
    let temp = netprobify_context();
    fs::write(temp.path().join("VERSION"), "  \n").unwrap();
    assert!(matches!(
      BuildContext::open(temp.path(), ContextLayout::default()),
      Err(ContextError::EmptyVersion(_))
    ));
  }

  #[test]
  fn prepare_hashes_every_recipe_source() {
    let temp = netprobify_context();
    let mut ctx = BuildContext::open(temp.path(), ContextLayout::default()).unwrap();
    ctx.prepare(&ImageRecipe::netprobify()).unwrap();

    for source in ["requirements.txt", "netprobify", "netprobify_start.py", "VERSION"] {
      assert_eq!(ctx.input_hash(source).unwrap().0.len(), 64);
    }
    assert!(matches!(ctx.input_hash("other"), Err(ContextError::NotStaged(_))));
  }

  #[test]
  fn source_edit_leaves_manifest_hash_alone() {
    let temp = netprobify_context();
    let mut before = BuildContext::open(temp.path(), ContextLayout::default()).unwrap();
    before.prepare(&ImageRecipe::netprobify()).unwrap();

    fs::write(temp.path().join("netprobify/main.py"), "def main(): return 1\n").unwrap();
    let mut after = BuildContext::open(temp.path(), ContextLayout::default()).unwrap();
    after.prepare(&ImageRecipe::netprobify()).unwrap();

    assert_eq!(
      before.input_hash("requirements.txt").unwrap(),
      after.input_hash("requirements.txt").unwrap()
    );
    assert_ne!(
      before.input_hash("netprobify").unwrap(),
      after.input_hash("netprobify").unwrap()
    );
  }

  #[test]
  fn bytecode_caches_do_not_change_source_hash() {
    let temp = netprobify_context();
    let mut before = BuildContext::open(temp.path(), ContextLayout::default()).unwrap();
    before.prepare(&ImageRecipe::netprobify()).unwrap();

    fs::create_dir(temp.path().join("netprobify/__pycache__")).unwrap();
    fs::write(temp.path().join("netprobify/__pycache__/main.pyc"), "x").unwrap();
    let mut after = BuildContext::open(temp.path(), ContextLayout::default()).unwrap();
    after.prepare(&ImageRecipe::netprobify()).unwrap();

    assert_eq!(
      before.input_hash("netprobify").unwrap(),
      after.input_hash("netprobify").unwrap()
    );
  }

  #[test]
  fn recipe_must_copy_version_marker() {
    let temp = netprobify_context();
    let mut recipe = ImageRecipe::netprobify();
    recipe
      .steps
      .retain(|s| !matches!(s, Step::Copy { source, .. } if source == "VERSION"));

    let mut ctx = BuildContext::open(temp.path(), ContextLayout::default()).unwrap();
    assert!(matches!(ctx.prepare(&recipe), Err(ContextError::NotCopied(ref p)) if p == "VERSION"));
  }

  #[test]
  fn recipe_must_install_from_context_manifest() {
    let temp = netprobify_context();
    let layout = ContextLayout {
      dependency_manifest: "requirements/prod.txt".to_string(),
      ..Default::default()
    };
    fs::create_dir(temp.path().join("requirements")).unwrap();
    fs::write(temp.path().join("requirements/prod.txt"), "scapy\n").unwrap();

    let mut ctx = BuildContext::open(temp.path(), layout).unwrap();
    assert!(matches!(
      ctx.prepare(&ImageRecipe::netprobify()),
      Err(ContextError::ManifestMismatch { .. })
    ));
  }
}
