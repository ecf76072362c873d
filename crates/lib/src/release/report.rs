//! Machine-readable summary of a run.
//!
//! The report is built from the run's public outputs only (states, tag,
//! digests, cache counters). It never sees credentials or session tokens.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

use super::state::{RunState, Transition};
use crate::build::ImageArtifact;
use crate::execute::TargetError;
use crate::oci::Digest;
use crate::platform::Platform;

#[derive(Debug, Error)]
pub enum ReportError {
  #[error("failed to write report {path}: {source}")]
  Write {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to serialize report: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// Coarse failure category, stable for scripts reading the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
  Tag,
  Auth,
  PartialTargets,
  Publish,
  Cancelled,
  Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
  Built,
  Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
  pub platform: Platform,
  pub status: TargetStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub manifest_digest: Option<Digest>,
  /// Manifest digest of the base image the target was built on.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub base_digest: Option<Digest>,
  pub cache_hits: usize,
  pub cache_misses: usize,
  pub layer_bytes: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl TargetReport {
  pub fn built(image: &ImageArtifact) -> Self {
    Self {
      platform: image.platform.clone(),
      status: TargetStatus::Built,
      manifest_digest: Some(image.manifest_digest().clone()),
      base_digest: Some(image.base.digest.clone()),
      cache_hits: image.cache_hits(),
      cache_misses: image.cache_misses(),
      layer_bytes: image.layer_bytes(),
      error: None,
    }
  }

  pub fn failed(platform: &Platform, error: &TargetError) -> Self {
    Self {
      platform: platform.clone(),
      status: TargetStatus::Failed,
      manifest_digest: None,
      base_digest: None,
      cache_hits: 0,
      cache_misses: 0,
      layer_bytes: 0,
      error: Some(error.to_string()),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
  pub event: String,
  pub trigger: String,
  pub state: RunState,
  pub history: Vec<Transition>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reference: Option<String>,
  pub targets: Vec<TargetReport>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub index_digest: Option<Digest>,
  pub blobs_pushed: usize,
  pub blobs_skipped: usize,
  pub dry_run: bool,
  pub duration_ms: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure: Option<FailureKind>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl RunReport {
  pub fn new(event: &str, trigger: String) -> Self {
    Self {
      event: event.to_string(),
      trigger,
      state: RunState::Idle,
      history: Vec::new(),
      tag: None,
      reference: None,
      targets: Vec::new(),
      index_digest: None,
      blobs_pushed: 0,
      blobs_skipped: 0,
      dry_run: false,
      duration_ms: 0,
      failure: None,
      error: None,
    }
  }

  pub fn is_published(&self) -> bool {
    self.state == RunState::Published
  }

  pub fn cache_hits(&self) -> usize {
    self.targets.iter().map(|t| t.cache_hits).sum()
  }

  pub fn cache_misses(&self) -> usize {
    self.targets.iter().map(|t| t.cache_misses).sum()
  }

  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(self)
  }

  /// Write the report as JSON, atomically.
  pub fn write(&self, path: &Path) -> Result<(), ReportError> {
    let json = self.to_json()?;
    let io_err = |source: std::io::Error| ReportError::Write {
      path: path.display().to_string(),
      source,
    };

    let dir = match path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent,
      _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut temp = NamedTempFile::new_in(dir).map_err(io_err)?;
    temp.write_all(json.as_bytes()).map_err(io_err)?;
    temp.write_all(b"\n").map_err(io_err)?;
    temp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
  }
}
