//! Base images.
//!
//! Every image starts from the layers of its base. A [`BaseSource`] resolves
//! the recipe's base reference to the single-platform image for one target,
//! following an index (manifest list) when the reference names one, and
//! serves the base layer blobs for materializing `RUN` steps and for
//! publishing.
//!
//! - [`RegistryBase`] pulls from a registry with an anonymous pull session
//! - [`LayoutBase`] reads an OCI image layout directory

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::oci::layout::{LayoutError, OciLayout};
use crate::oci::{
  ContainerConfig, Descriptor, Digest, ImageConfig, ImageIndex, ImageManifest, LayerCompression, OciError,
  is_index, is_manifest,
};
use crate::platform::Platform;
use crate::recipe::BaseImage;
use crate::registry::{Manifest, Registry, RegistryError, SessionKeeper};

#[derive(Debug, Error)]
pub enum BaseError {
  #[error(transparent)]
  Registry(#[from] RegistryError),

  #[error(transparent)]
  Layout(#[from] LayoutError),

  #[error(transparent)]
  Oci(#[from] OciError),

  #[error("base image {0} was not found")]
  NotFound(String),

  #[error("base image {reference} has no image for {platform}")]
  NoPlatform { reference: String, platform: Platform },

  #[error("base image {reference} is malformed: {message}")]
  Invalid { reference: String, message: String },

  #[error("{0} is not a layer of the base image")]
  UnknownLayer(Digest),

  #[error("failed to read base layer: {0}")]
  Task(String),
}

/// One base layer. The descriptor carries the OCI media type even when the
/// registry served a Docker one; the blob bytes are the same.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseLayer {
  pub descriptor: Descriptor,
  pub diff_id: Digest,
}

/// The base image for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBase {
  /// The reference as written in the recipe.
  pub reference: String,
  /// Repository the image was read from.
  pub repository: String,
  /// Digest of the single-platform manifest.
  pub digest: Digest,
  /// Runtime defaults inherited by the built image.
  pub config: ContainerConfig,
  /// Bottom-most first.
  pub layers: Vec<BaseLayer>,
}

impl ResolvedBase {
  pub fn layer(&self, digest: &Digest) -> Option<&BaseLayer> {
    self.layers.iter().find(|l| l.descriptor.digest == *digest)
  }

  /// Base environment as `KEY -> value`.
  pub fn env(&self) -> BTreeMap<String, String> {
    self
      .config
      .env
      .iter()
      .filter_map(|entry| entry.split_once('='))
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }
}

#[async_trait]
pub trait BaseSource: Send + Sync {
  /// Resolve `base` to the image that runs on `platform`.
  async fn resolve(&self, base: &BaseImage, platform: &Platform) -> Result<ResolvedBase, BaseError>;

  /// Compressed bytes of one layer of `base`.
  async fn layer(&self, base: &ResolvedBase, digest: &Digest) -> Result<Vec<u8>, BaseError>;
}

/// Read access to one image store, enough to walk from a reference to layers.
#[async_trait]
trait ImageStore: Send + Sync {
  async fn manifest(&self, reference: &str) -> Result<Option<Manifest>, BaseError>;

  async fn blob(&self, digest: &Digest) -> Result<Vec<u8>, BaseError>;
}

fn parse<T: DeserializeOwned>(reference: &str, what: &str, body: &[u8]) -> Result<T, BaseError> {
  serde_json::from_slice(body).map_err(|e| BaseError::Invalid {
    reference: reference.to_string(),
    message: format!("unreadable {}: {}", what, e),
  })
}

/// Media type of a manifest body that arrived without one.
fn sniff_media_type(body: &[u8]) -> String {
  let Ok(doc) = serde_json::from_slice::<serde_json::Value>(body) else {
    return String::new();
  };
  if let Some(media_type) = doc.get("mediaType").and_then(|m| m.as_str()) {
    return media_type.to_string();
  }
  if doc.get("manifests").is_some() {
    crate::oci::MEDIA_TYPE_INDEX.to_string()
  } else {
    crate::oci::MEDIA_TYPE_MANIFEST.to_string()
  }
}

async fn resolve_from(
  store: &dyn ImageStore,
  base: &BaseImage,
  repository: &str,
  platform: &Platform,
) -> Result<ResolvedBase, BaseError> {
  let reference = base.to_string();
  let not_found = || BaseError::NotFound(reference.clone());
  let no_platform = || BaseError::NoPlatform {
    reference: reference.clone(),
    platform: platform.clone(),
  };

  let top = store.manifest(base.reference()).await?.ok_or_else(not_found)?;
  let manifest = if is_index(&top.media_type) {
    let index: ImageIndex = parse(&reference, "index", &top.body)?;
    let entry = index.select(platform).ok_or_else(no_platform)?;
    store.manifest(entry.digest.as_str()).await?.ok_or_else(not_found)?
  } else if is_manifest(&top.media_type) {
    top
  } else {
    return Err(OciError::UnsupportedMediaType(top.media_type).into());
  };

  let image: ImageManifest = parse(&reference, "manifest", &manifest.body)?;
  let config_data = store.blob(&image.config.digest).await?;
  let config: ImageConfig = parse(&reference, "config", &config_data)?;

  if config.os != platform.os.as_str() || config.architecture != platform.arch.as_str() {
    return Err(no_platform());
  }
  if config.rootfs.diff_ids.len() != image.layers.len() {
    return Err(BaseError::Invalid {
      reference,
      message: format!(
        "{} layers but {} diff ids",
        image.layers.len(),
        config.rootfs.diff_ids.len()
      ),
    });
  }

  let mut layers = Vec::with_capacity(image.layers.len());
  for (descriptor, diff_id) in image.layers.into_iter().zip(config.rootfs.diff_ids) {
    let compression = LayerCompression::of(&descriptor.media_type)?;
    layers.push(BaseLayer {
      descriptor: Descriptor {
        media_type: compression.media_type().to_string(),
        ..descriptor
      },
      diff_id,
    });
  }

  info!(
    base = %reference,
    platform = %platform,
    digest = %manifest.digest,
    layers = layers.len(),
    "resolved base image"
  );

  Ok(ResolvedBase {
    reference,
    repository: repository.to_string(),
    digest: manifest.digest,
    config: config.config,
    layers,
  })
}

/// Base images pulled from a registry.
///
/// Layer blobs are kept in memory once fetched, so every `RUN` step and the
/// publish of each platform download them once.
pub struct RegistryBase {
  registry: Arc<dyn Registry>,
  sessions: Mutex<BTreeMap<String, Arc<SessionKeeper>>>,
  blobs: Mutex<HashMap<Digest, Vec<u8>>>,
}

struct RegistryStore {
  keeper: Arc<SessionKeeper>,
}

#[async_trait]
impl ImageStore for RegistryStore {
  async fn manifest(&self, reference: &str) -> Result<Option<Manifest>, BaseError> {
    let session = self.keeper.session().await?;
    let manifest = self.keeper.registry().fetch_manifest(&session, reference).await?;
    Ok(manifest.map(|mut m| {
      if m.media_type.is_empty() {
        m.media_type = sniff_media_type(&m.body);
      }
      m
    }))
  }

  async fn blob(&self, digest: &Digest) -> Result<Vec<u8>, BaseError> {
    let session = self.keeper.session().await?;
    Ok(self.keeper.registry().fetch_blob(&session, digest).await?)
  }
}

impl RegistryBase {
  /// Pull base images from `registry`, which must serve the base's host.
  pub fn new(registry: Arc<dyn Registry>) -> Self {
    Self {
      registry,
      sessions: Mutex::new(BTreeMap::new()),
      blobs: Mutex::new(HashMap::new()),
    }
  }

  async fn store(&self, repository: &str) -> RegistryStore {
    let mut sessions = self.sessions.lock().await;
    let keeper = sessions
      .entry(repository.to_string())
      .or_insert_with(|| Arc::new(SessionKeeper::pull(self.registry.clone(), repository)))
      .clone();
    RegistryStore { keeper }
  }
}

#[async_trait]
impl BaseSource for RegistryBase {
  async fn resolve(&self, base: &BaseImage, platform: &Platform) -> Result<ResolvedBase, BaseError> {
    let (_, repository) = base.location();
    let store = self.store(&repository).await;
    resolve_from(&store, base, &repository, platform).await
  }

  async fn layer(&self, base: &ResolvedBase, digest: &Digest) -> Result<Vec<u8>, BaseError> {
    if base.layer(digest).is_none() {
      return Err(BaseError::UnknownLayer(digest.clone()));
    }
    if let Some(data) = self.blobs.lock().await.get(digest) {
      return Ok(data.clone());
    }

    debug!(base = %base.reference, digest = %digest, "fetching base layer");
    let data = self.store(&base.repository).await.blob(digest).await?;
    self.blobs.lock().await.insert(digest.clone(), data.clone());
    Ok(data)
  }
}

/// Base images read from an OCI image layout.
///
/// The base is looked up in `index.json` by tag (the
/// `org.opencontainers.image.ref.name` annotation) or, when pinned, by digest.
#[derive(Debug, Clone)]
pub struct LayoutBase {
  layout: OciLayout,
}

impl LayoutBase {
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, BaseError> {
    Ok(Self {
      layout: OciLayout::open(root)?,
    })
  }

  async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, BaseError> {
    let layout = self.layout.clone();
    let digest = digest.clone();
    tokio::task::spawn_blocking(move || layout.read_blob(&digest))
      .await
      .map_err(|e| BaseError::Task(e.to_string()))?
      .map_err(BaseError::from)
  }
}

#[async_trait]
impl ImageStore for LayoutBase {
  async fn manifest(&self, reference: &str) -> Result<Option<Manifest>, BaseError> {
    if let Ok(digest) = reference.parse::<Digest>()
      && self.layout.has_blob(&digest)
    {
      let body = self.read_blob(&digest).await?;
      return Ok(Some(Manifest {
        media_type: sniff_media_type(&body),
        body,
        digest,
      }));
    }

    let Some(entry) = self.layout.find(reference)? else {
      return Ok(None);
    };
    let body = self.read_blob(&entry.digest).await?;
    let media_type = if entry.media_type.is_empty() {
      sniff_media_type(&body)
    } else {
      entry.media_type
    };
    Ok(Some(Manifest {
      media_type,
      body,
      digest: entry.digest,
    }))
  }

  async fn blob(&self, digest: &Digest) -> Result<Vec<u8>, BaseError> {
    self.read_blob(digest).await
  }
}

#[async_trait]
impl BaseSource for LayoutBase {
  async fn resolve(&self, base: &BaseImage, platform: &Platform) -> Result<ResolvedBase, BaseError> {
    let (_, repository) = base.location();
    resolve_from(self, base, &repository, platform).await
  }

  async fn layer(&self, base: &ResolvedBase, digest: &Digest) -> Result<Vec<u8>, BaseError> {
    if base.layer(digest).is_none() {
      return Err(BaseError::UnknownLayer(digest.clone()));
    }
    self.read_blob(digest).await
  }
}

/// Test base images: a tiny `python:3.11.9-slim-bookworm` with one layer per
/// platform, written to an OCI layout.
#[cfg(test)]
pub(crate) mod fixtures {
  use std::fs;
  use std::path::Path;

  use super::*;
  use crate::build::layer::pack_tree;
  use crate::oci::{Blob, MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST, PlatformSpec};
  use crate::platform::arch::Arch;
  use crate::platform::os::Os;

  pub const TAG: &str = "3.11.9-slim-bookworm";

  pub fn platforms() -> Vec<Platform> {
    vec![Platform::new(Os::Linux, Arch::Amd64), Platform::new(Os::Linux, Arch::Arm64)]
  }

  /// Write the base image for `platforms` into a layout at `root`.
  pub fn python_layout(root: &Path, platforms: &[Platform]) -> LayoutBase {
    let layout = OciLayout::create(root).unwrap();
    let mut entries = Vec::new();

    for platform in platforms {
      let tree = tempfile::TempDir::new().unwrap();
      fs::create_dir_all(tree.path().join("usr/local/bin")).unwrap();
      fs::create_dir_all(tree.path().join("etc")).unwrap();
      fs::write(tree.path().join("usr/local/bin/python3"), "#!/bin/sh\n").unwrap();
      fs::write(tree.path().join("etc/arch"), format!("{}\n", platform.arch.as_str())).unwrap();
      let layer = pack_tree(tree.path()).unwrap();
      layout.write_blob(&layer.data).unwrap();

      let container = ContainerConfig {
        env: vec![
          "PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
          "LANG=C.UTF-8".to_string(),
          "PYTHON_VERSION=3.11.9".to_string(),
        ],
        cmd: vec!["python3".to_string()],
        ..Default::default()
      };
      let config = Blob::from_json(
        MEDIA_TYPE_CONFIG,
        &ImageConfig::new(platform, container, vec![layer.diff_id.clone()]),
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
      entry.platform = Some(PlatformSpec::from(platform));
      entries.push(entry);
    }

    let index = Blob::from_json(MEDIA_TYPE_INDEX, &ImageIndex::new(entries)).unwrap();
    layout.write_blob(&index.data).unwrap();
    layout.tag(TAG, index.descriptor).unwrap();
    LayoutBase::open(root).unwrap()
  }
}

#[cfg(test)]
mod tests {
  use super::fixtures::{TAG, platforms, python_layout};
  use super::*;
  use crate::oci::{
    Blob, MEDIA_TYPE_DOCKER_CONFIG, MEDIA_TYPE_DOCKER_LAYER_GZIP, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_LAYER_GZIP,
  };
  use crate::platform::arch::Arch;
  use crate::platform::os::Os;
  use crate::registry::MemoryRegistry;
  use crate::secret::Credentials;
  use tempfile::TempDir;

  fn python() -> BaseImage {
    format!("python:{}", TAG).parse().unwrap()
  }

  #[tokio::test]
  async fn layout_base_selects_platform_from_index() {
    let temp = TempDir::new().unwrap();
    let source = python_layout(temp.path(), &platforms());

    let amd = source.resolve(&python(), &platforms()[0]).await.unwrap();
    let arm = source.resolve(&python(), &platforms()[1]).await.unwrap();

    assert_ne!(amd.digest, arm.digest);
    assert_eq!(amd.layers.len(), 1);
    assert_eq!(amd.repository, "library/python");
    assert_eq!(amd.config.cmd, vec!["python3"]);
    assert_eq!(amd.env()["PATH"], "/usr/local/bin:/usr/bin:/bin");

    let data = source.layer(&arm, &arm.layers[0].descriptor.digest).await.unwrap();
    assert_eq!(Digest::of(&data), arm.layers[0].descriptor.digest);
  }

  #[tokio::test]
  async fn missing_platform_is_reported() {
    let temp = TempDir::new().unwrap();
    let source = python_layout(temp.path(), &platforms()[..1]);

    let err = source
      .resolve(&python(), &Platform::new(Os::Linux, Arch::Arm64))
      .await
      .unwrap_err();
    assert!(matches!(err, BaseError::NoPlatform { .. }));
  }

  #[tokio::test]
  async fn pinned_digest_resolves_without_tag() {
    let temp = TempDir::new().unwrap();
    let source = python_layout(temp.path(), &platforms());
    let index = OciLayout::open(temp.path()).unwrap().find(TAG).unwrap().unwrap();

    let pinned: BaseImage = format!("python@{}", index.digest).parse().unwrap();
    let resolved = source.resolve(&pinned, &platforms()[0]).await.unwrap();
    assert_eq!(resolved.layers.len(), 1);

    let missing: BaseImage = format!("python@{}", Digest::of(b"nope")).parse().unwrap();
    assert!(matches!(
      source.resolve(&missing, &platforms()[0]).await,
      Err(BaseError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn unknown_layer_is_refused() {
    let temp = TempDir::new().unwrap();
    let source = python_layout(temp.path(), &platforms());
    let base = source.resolve(&python(), &platforms()[0]).await.unwrap();

    let err = source.layer(&base, &Digest::of(b"other")).await.unwrap_err();
    assert!(matches!(err, BaseError::UnknownLayer(_)));
  }

  /// Publish the fixture image to a registry the way Docker Hub serves it.
  async fn docker_hub(platform: &Platform) -> (Arc<MemoryRegistry>, Digest) {
    let registry = Arc::new(MemoryRegistry::new("docker.io"));
    let session = registry
      .authenticate("library/python", &Credentials::new("hub", "hub"))
      .await
      .unwrap();

    let layer = b"python-layer".to_vec();
    registry
      .push_blob(&session, &Digest::of(&layer), &layer)
      .await
      .unwrap();
    let config = Blob::from_json(
      MEDIA_TYPE_DOCKER_CONFIG,
      &ImageConfig::new(platform, ContainerConfig::default(), vec![Digest::of(b"python-tar")]),
    )
    .unwrap();
    registry
      .push_blob(&session, &config.descriptor.digest, &config.data)
      .await
      .unwrap();

    let mut manifest = ImageManifest::new(
      config.descriptor,
      vec![Descriptor::for_bytes(MEDIA_TYPE_DOCKER_LAYER_GZIP, &layer)],
    );
    manifest.media_type = MEDIA_TYPE_DOCKER_MANIFEST.to_string();
    let body = serde_json::to_vec(&manifest).unwrap();
    let manifest_digest = registry
      .push_manifest(&session, Digest::of(&body).as_str(), MEDIA_TYPE_DOCKER_MANIFEST, &body)
      .await
      .unwrap();

    let mut entry = Descriptor::for_bytes(MEDIA_TYPE_DOCKER_MANIFEST, &body);
    entry.platform = Some(platform.into());
    let mut list = ImageIndex::new(vec![entry]);
    list.media_type = MEDIA_TYPE_DOCKER_MANIFEST_LIST.to_string();
    let list_body = serde_json::to_vec(&list).unwrap();
    registry
      .push_manifest(&session, TAG, MEDIA_TYPE_DOCKER_MANIFEST_LIST, &list_body)
      .await
      .unwrap();

    (registry, manifest_digest)
  }

  #[tokio::test]
  async fn registry_base_follows_docker_manifest_list() {
    let platform = Platform::new(Os::Linux, Arch::Amd64);
    let (registry, manifest_digest) = docker_hub(&platform).await;
    let source = RegistryBase::new(registry.clone());

    let base = source.resolve(&python(), &platform).await.unwrap();
    assert_eq!(base.digest, manifest_digest);
    assert_eq!(base.layers[0].descriptor.media_type, MEDIA_TYPE_LAYER_GZIP);
    assert_eq!(base.layers[0].diff_id, Digest::of(b"python-tar"));

    let digest = base.layers[0].descriptor.digest.clone();
    assert_eq!(source.layer(&base, &digest).await.unwrap(), b"python-layer");
    source.layer(&base, &digest).await.unwrap();
    // one push session for the fixture, one pull session for the base
    assert_eq!(registry.sessions_issued(), 2);
  }
}
