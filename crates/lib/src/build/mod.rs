//! Image building.
//!
//! A build turns one recipe, one prepared context and one target platform into
//! an [`ImageArtifact`]: the ordered layers plus the image config and manifest
//! blobs. The image starts from the base resolved for the platform: its layers
//! come first and its runtime defaults are inherited. Instructions are
//! evaluated in order. Every instruction extends the cache key chain, which is
//! rooted at the base manifest digest; layer-producing instructions look their
//! key up in the [`LayerCache`] first and only run on a miss.
//!
//! A failing step aborts the build. No partial artifact is returned and
//! nothing is retried.
//!
//! # Submodules
//!
//! - [`base`] - resolving the base image per platform
//! - [`executor`] - the [`StepExecutor`] seam and the process-based executor
//! - [`layer`] - deterministic tar+gzip layer packing, unpacking and diffing

pub mod base;
pub mod executor;
pub mod layer;
mod types;

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::cache::{CacheKey, CacheMode, LayerCache};
use crate::context::BuildContext;
use crate::oci::{
  Blob, ContainerConfig, ImageConfig, ImageManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_MANIFEST,
};
use crate::platform::Platform;
use crate::recipe::render::{LABEL_BASE_DIGEST, LABEL_VERSION};
use crate::recipe::{ImageRecipe, Instruction};

pub use base::{BaseError, BaseLayer, BaseSource, LayoutBase, RegistryBase, ResolvedBase};
pub use executor::{ProcessExecutor, ProcessOptions, StepExecutor, StepRequest};
pub use types::*;

/// Build `recipe` for `platform` on top of `base`, which `source` resolved
/// for that platform.
///
/// The context must already be prepared for the recipe
/// ([`BuildContext::prepare`]).
#[allow(clippy::too_many_arguments)]
pub async fn build_image(
  recipe: &ImageRecipe,
  context: &BuildContext,
  platform: &Platform,
  base: &ResolvedBase,
  source: &dyn BaseSource,
  cache: &dyn LayerCache,
  executor: &dyn StepExecutor,
  mode: CacheMode,
) -> Result<ImageArtifact, BuildError> {
  recipe.validate()?;

  let instructions = recipe.instructions();
  let final_layer = instructions.iter().rposition(Instruction::produces_layer);

  info!(
    platform = %platform,
    base = %base.digest,
    instructions = instructions.len(),
    cache_mode = mode.as_str(),
    "building image"
  );

  let mut env: BTreeMap<String, String> = base.env();
  let mut workdir: Option<String> = base.config.working_dir.clone();
  let entrypoint = base.config.entrypoint.clone();
  let mut cmd: Vec<String> = base.config.cmd.clone();
  let mut labels = base.config.labels.clone();
  labels.extend(recipe.static_labels());
  labels.insert(LABEL_BASE_DIGEST.to_string(), base.digest.to_string());
  labels.insert(LABEL_VERSION.to_string(), context.version().to_string());

  let mut layers = Vec::new();
  let mut steps = Vec::new();
  let mut parent: Option<CacheKey> = None;

  for (index, instruction) in instructions.iter().enumerate() {
    let input = instruction.context_source().map(|s| context.input_hash(s)).transpose()?;
    let key = CacheKey::derive(parent.as_ref(), &base.digest, platform, instruction, input)?;
    parent = Some(key.clone());

    if !instruction.produces_layer() {
      match instruction {
        Instruction::Workdir { path } => workdir = Some(path.clone()),
        Instruction::Env { key, value } => {
          env.insert(key.clone(), value.clone());
        }
        Instruction::Label { key, value } => {
          labels.insert(key.clone(), value.clone());
        }
        Instruction::Cmd { argv } => cmd = argv.clone(),
        Instruction::Run { .. } | Instruction::Copy { .. } => {}
      }
      steps.push(StepRecord {
        instruction: instruction.describe(),
        key,
        status: StepStatus::Config,
        exported: false,
      });
      continue;
    }

    if let Some(layer) = cache.get(&key).await? {
      debug!(platform = %platform, step = index, key = %key.0.short(12), "cache hit");
      layers.push(layer);
      steps.push(StepRecord {
        instruction: instruction.describe(),
        key,
        status: StepStatus::Cached,
        exported: false,
      });
      continue;
    }

    debug!(platform = %platform, step = index, key = %key.0.short(12), "cache miss");
    let layer = executor
      .execute(StepRequest {
        platform,
        base,
        source,
        lower: &layers,
        instruction,
        env: &env,
        workdir: workdir.as_deref(),
        context,
      })
      .await?;

    let exported = mode.exports(final_layer == Some(index));
    if exported {
      cache.put(&key, &layer).await?;
    }
    layers.push(layer);
    steps.push(StepRecord {
      instruction: instruction.describe(),
      key,
      status: StepStatus::Built,
      exported,
    });
  }

  let container = ContainerConfig {
    env: env.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
    entrypoint,
    cmd,
    working_dir: workdir,
    labels,
  };
  let diff_ids = base
    .layers
    .iter()
    .map(|l| l.diff_id.clone())
    .chain(layers.iter().map(|l| l.diff_id.clone()))
    .collect();
  let config = Blob::from_json(MEDIA_TYPE_CONFIG, &ImageConfig::new(platform, container, diff_ids))?;

  let layer_descriptors = base
    .layers
    .iter()
    .map(|l| l.descriptor.clone())
    .chain(layers.iter().map(|l| l.descriptor.clone()))
    .collect();
  let manifest = Blob::from_json(
    MEDIA_TYPE_MANIFEST,
    &ImageManifest::new(config.descriptor.clone(), layer_descriptors),
  )?;

  let artifact = ImageArtifact {
    platform: platform.clone(),
    base: base.clone(),
    layers,
    config,
    manifest,
    steps,
  };

  info!(
    platform = %platform,
    digest = %artifact.manifest_digest(),
    cached = artifact.cache_hits(),
    built = artifact.cache_misses(),
    "image built"
  );

  Ok(artifact)
}
