//! OCI image layout directories.
//!
//! A layout is `oci-layout`, `index.json` and content-addressed blobs under
//! `blobs/sha256/`. Base images can be read from one (for example a
//! `skopeo copy ... oci:<dir>` export, or a mirror kept next to the build)
//! and built images can be written to one instead of a registry.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use super::{Descriptor, Digest, ImageIndex};

/// Index annotation naming the reference an entry was stored under.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Error)]
pub enum LayoutError {
  #[error("{path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("{path} is not valid JSON: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("{0} is not an OCI image layout")]
  NotALayout(PathBuf),

  #[error("blob {0} does not match its digest")]
  DigestMismatch(Digest),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
  image_layout_version: String,
}

#[derive(Debug, Clone)]
pub struct OciLayout {
  root: PathBuf,
}

fn io_error(path: &Path, source: std::io::Error) -> LayoutError {
  LayoutError::Io {
    path: path.to_path_buf(),
    source,
  }
}

impl OciLayout {
  /// Open an existing layout.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, LayoutError> {
    let root = root.into();
    if !root.join(LAYOUT_FILE).is_file() {
      return Err(LayoutError::NotALayout(root));
    }
    Ok(Self { root })
  }

  /// Open the layout at `root`, initializing it when absent.
  pub fn create(root: impl Into<PathBuf>) -> Result<Self, LayoutError> {
    let root = root.into();
    let layout = Self { root };
    if layout.root.join(LAYOUT_FILE).is_file() {
      return Ok(layout);
    }

    fs::create_dir_all(layout.blobs_dir()).map_err(|e| io_error(&layout.blobs_dir(), e))?;
    let marker = LayoutMarker {
      image_layout_version: LAYOUT_VERSION.to_string(),
    };
    layout.write_json(&layout.root.join(LAYOUT_FILE), &marker)?;
    layout.write_json(&layout.root.join(INDEX_FILE), &ImageIndex::new(Vec::new()))?;
    Ok(layout)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn blobs_dir(&self) -> PathBuf {
    self.root.join("blobs").join("sha256")
  }

  fn blob_path(&self, digest: &Digest) -> PathBuf {
    self.blobs_dir().join(digest.hex())
  }

  /// The top-level `index.json`.
  pub fn index(&self) -> Result<ImageIndex, LayoutError> {
    let path = self.root.join(INDEX_FILE);
    let content = fs::read(&path).map_err(|e| io_error(&path, e))?;
    serde_json::from_slice(&content).map_err(|source| LayoutError::Json { path, source })
  }

  /// The index entry stored under `name`, or whose digest is `name`.
  pub fn find(&self, name: &str) -> Result<Option<Descriptor>, LayoutError> {
    let index = self.index()?;
    Ok(index.manifests.into_iter().find(|entry| {
      entry.digest.as_str() == name || entry.annotations.get(ANNOTATION_REF_NAME).is_some_and(|r| r == name)
    }))
  }

  pub fn has_blob(&self, digest: &Digest) -> bool {
    self.blob_path(digest).is_file()
  }

  /// Read a blob and check it against its digest.
  pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, LayoutError> {
    let path = self.blob_path(digest);
    let data = fs::read(&path).map_err(|e| io_error(&path, e))?;
    if Digest::of(&data) != *digest {
      return Err(LayoutError::DigestMismatch(digest.clone()));
    }
    Ok(data)
  }

  /// Store a blob. Existing blobs are left untouched.
  pub fn write_blob(&self, data: &[u8]) -> Result<Digest, LayoutError> {
    let digest = Digest::of(data);
    let path = self.blob_path(&digest);
    if !path.is_file() {
      self.write_atomic(&path, data)?;
    }
    Ok(digest)
  }

  /// Record `descriptor` in `index.json` under `name`, replacing any entry
  /// previously stored under the same name.
  pub fn tag(&self, name: &str, mut descriptor: Descriptor) -> Result<(), LayoutError> {
    let mut index = self.index()?;
    index
      .manifests
      .retain(|entry| entry.annotations.get(ANNOTATION_REF_NAME).is_none_or(|r| r != name));
    descriptor
      .annotations
      .insert(ANNOTATION_REF_NAME.to_string(), name.to_string());
    index.manifests.push(descriptor);
    self.write_json(&self.root.join(INDEX_FILE), &index)
  }

  fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), LayoutError> {
    let data = serde_json::to_vec_pretty(value).map_err(|source| LayoutError::Json {
      path: path.to_path_buf(),
      source,
    })?;
    self.write_atomic(path, &data)
  }

  fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), LayoutError> {
    let dir = path.parent().unwrap_or(&self.root);
    fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
    let mut temp = NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
    temp.write_all(data).map_err(|e| io_error(path, e))?;
    temp.persist(path).map_err(|e| io_error(path, e.error))?;
    Ok(())
  }
}
