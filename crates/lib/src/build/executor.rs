//! Step execution.
//!
//! The builder decides *whether* an instruction runs (cache lookup); a
//! [`StepExecutor`] decides *how*. [`ProcessExecutor`] is the bundled
//! implementation: `COPY` is packed straight from the build context, and
//! `RUN` unpacks the base and every earlier layer into a root filesystem,
//! hands the command to an isolating wrapper (a container runtime started on
//! that root) and packs what the command changed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use super::base::{BaseSource, ResolvedBase};
use super::layer::{Snapshot, pack_copy, pack_diff, unpack_into};
use super::types::BuildError;
use crate::cache::CachedLayer;
use crate::consts::SOURCE_DATE_EPOCH;
use crate::context::BuildContext;
use crate::oci::LayerCompression;
use crate::platform::Platform;
use crate::recipe::Instruction;

/// Everything an executor needs to produce one layer.
#[derive(Clone, Copy)]
pub struct StepRequest<'a> {
  pub platform: &'a Platform,
  pub base: &'a ResolvedBase,
  /// Serves the base layer blobs.
  pub source: &'a dyn BaseSource,
  /// Layers already produced for this image, bottom-most first.
  pub lower: &'a [CachedLayer],
  pub instruction: &'a Instruction,
  /// Base environment overlaid with earlier `ENV` instructions.
  pub env: &'a BTreeMap<String, String>,
  pub workdir: Option<&'a str>,
  pub context: &'a BuildContext,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
  /// Execute a layer-producing instruction and return the layer.
  async fn execute(&self, request: StepRequest<'_>) -> Result<CachedLayer, BuildError>;
}

/// How `RUN` commands are launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
  /// Command prefix for `RUN`, for example
  /// `["podman", "run", "--rm", "--platform", "{platform}", "--env-host",
  /// "--rootfs", "{rootfs}", "/bin/sh", "-c"]`. `{platform}`, `{base}`,
  /// `{rootfs}` and `{workdir}` are substituted; the command string is
  /// appended as the last argument. `RUN` steps are refused without one.
  pub wrapper: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
  options: ProcessOptions,
}

impl ProcessExecutor {
  pub fn new(options: ProcessOptions) -> Self {
    Self { options }
  }

  fn argv(&self, wrapper: &[String], request: &StepRequest<'_>, rootfs: &Path, command: &str) -> Vec<String> {
    let platform = request.platform.to_string();
    let base = format!("{}@{}", request.base.reference, request.base.digest);
    let rootfs = rootfs.display().to_string();
    let workdir = request.workdir.unwrap_or("/");
    let mut argv: Vec<String> = wrapper
      .iter()
      .map(|arg| {
        arg
          .replace("{platform}", &platform)
          .replace("{base}", &base)
          .replace("{rootfs}", &rootfs)
          .replace("{workdir}", workdir)
      })
      .collect();
    argv.push(command.to_string());
    argv
  }

  /// Unpack the base and every earlier layer into `root`.
  async fn materialize(&self, request: &StepRequest<'_>, root: &Path) -> Result<(), BuildError> {
    for layer in &request.base.layers {
      let data = request.source.layer(request.base, &layer.descriptor.digest).await?;
      let compression = LayerCompression::of(&layer.descriptor.media_type)?;
      let root = root.to_path_buf();
      blocking(request, move || unpack_into(&data, compression, &root)).await??;
    }
    for layer in request.lower {
      let data = layer.data.clone();
      let root = root.to_path_buf();
      blocking(request, move || unpack_into(&data, LayerCompression::Gzip, &root)).await??;
    }
    debug!(
      platform = %request.platform,
      base_layers = request.base.layers.len(),
      lower_layers = request.lower.len(),
      "materialized root filesystem"
    );
    Ok(())
  }

  async fn run(&self, request: &StepRequest<'_>, command: &str) -> Result<CachedLayer, BuildError> {
    let step_failed = |message: String| BuildError::StepFailed {
      platform: request.platform.clone(),
      step: request.instruction.describe(),
      message,
    };
    let Some(wrapper) = &self.options.wrapper else {
      return Err(BuildError::Unisolated {
        platform: request.platform.clone(),
        step: request.instruction.describe(),
      });
    };

    let rootfs = tempfile::Builder::new()
      .prefix("probeship-rootfs-")
      .tempdir()
      .map_err(|e| step_failed(format!("failed to create rootfs: {}", e)))?;
    let root: PathBuf = rootfs.path().to_path_buf();

    self.materialize(request, &root).await?;
    let snapshot_root = root.clone();
    let before = blocking(request, move || Snapshot::take(&snapshot_root)).await??;

    let argv = self.argv(wrapper, request, &root, command);
    let Some((program, args)) = argv.split_first() else {
      return Err(step_failed("wrapper command is empty".to_string()));
    };

    info!(platform = %request.platform, command = %command, "running step");

    let platform = request.platform;
    let mut cmd = Command::new(program);
    cmd
      .args(args)
      .current_dir(&root)
      .env_clear()
      .env("PATH", std::env::var("PATH").unwrap_or_default())
      .env("HOME", "/root")
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH.to_string())
      .env("ROOTFS", &root)
      .env("TARGETPLATFORM", platform.to_string())
      .env("TARGETOS", platform.os.as_str())
      .env("TARGETARCH", platform.arch.as_str())
      .env("TARGETVARIANT", platform.variant.as_deref().unwrap_or(""));
    if let Some(workdir) = request.workdir {
      cmd.env("WORKDIR", workdir);
    }
    for (key, value) in request.env {
      cmd.env(key, value);
    }

    let output = cmd
      .output()
      .await
      .map_err(|e| step_failed(format!("failed to spawn {}: {}", program, e)))?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      if !stderr.is_empty() {
        debug!(stderr = %stderr, "command stderr");
      }
      return Err(BuildError::CmdFailed {
        platform: platform.clone(),
        command: command.to_string(),
        code: output.status.code(),
      });
    }

    let layer = blocking(request, move || pack_diff(&root, &before)).await??;
    Ok(layer)
  }
}

/// Run filesystem work off the async workers.
async fn blocking<T, F>(request: &StepRequest<'_>, work: F) -> Result<T, BuildError>
where
  T: Send + 'static,
  F: FnOnce() -> T + Send + 'static,
{
  tokio::task::spawn_blocking(work)
    .await
    .map_err(|e| BuildError::StepFailed {
      platform: request.platform.clone(),
      step: request.instruction.describe(),
      message: e.to_string(),
    })
}

#[async_trait]
impl StepExecutor for ProcessExecutor {
  async fn execute(&self, request: StepRequest<'_>) -> Result<CachedLayer, BuildError> {
    match request.instruction {
      Instruction::Copy { source, dest } => {
        let src = request.context.path(source);
        let dest = dest.clone();
        let context = request.context.clone();
        let layer =
          blocking(&request, move || pack_copy(&src, &dest, &|name: &str| context.excludes(name))).await??;
        Ok(layer)
      }
      Instruction::Run { command } => self.run(&request, command).await,
      other => Err(BuildError::StepFailed {
        platform: request.platform.clone(),
        step: other.describe(),
        message: "instruction does not produce a layer".to_string(),
      }),
    }
  }
}
