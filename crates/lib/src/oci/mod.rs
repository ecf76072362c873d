//! OCI image documents.
//!
//! The subset of the OCI image format needed to publish a multi-architecture
//! image: content digests, descriptors, the image config, per-platform image
//! manifests and the image index (manifest list) that groups them.
//!
//! Every document serializes deterministically: struct fields in declaration
//! order, maps as `BTreeMap`, no timestamps. Building the same inputs twice
//! therefore yields byte-identical documents and identical digests.

pub mod layout;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::Platform;
use crate::util::hash::hash_bytes;

pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

// Docker schema 2 equivalents, as served for most public base images.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Manifest media types accepted when reading images, most specific first.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
  MEDIA_TYPE_INDEX,
  MEDIA_TYPE_MANIFEST,
  MEDIA_TYPE_DOCKER_MANIFEST_LIST,
  MEDIA_TYPE_DOCKER_MANIFEST,
];

#[derive(Debug, Error)]
pub enum OciError {
  #[error("invalid digest '{0}': expected sha256:<64 lowercase hex>")]
  InvalidDigest(String),

  #[error("failed to serialize document: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("unsupported media type '{0}'")]
  UnsupportedMediaType(String),
}

/// Whether `media_type` names a multi-platform index.
pub fn is_index(media_type: &str) -> bool {
  media_type == MEDIA_TYPE_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Whether `media_type` names a single-platform image manifest.
pub fn is_manifest(media_type: &str) -> bool {
  media_type == MEDIA_TYPE_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// Compression of a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
  Gzip,
  None,
}

impl LayerCompression {
  pub fn of(media_type: &str) -> Result<Self, OciError> {
    match media_type {
      MEDIA_TYPE_LAYER_GZIP | MEDIA_TYPE_DOCKER_LAYER_GZIP => Ok(Self::Gzip),
      MEDIA_TYPE_LAYER_TAR => Ok(Self::None),
      other => Err(OciError::UnsupportedMediaType(other.to_string())),
    }
  }

  /// OCI media type for a layer with this compression.
  pub fn media_type(&self) -> &'static str {
    match self {
      Self::Gzip => MEDIA_TYPE_LAYER_GZIP,
      Self::None => MEDIA_TYPE_LAYER_TAR,
    }
  }
}

/// A content digest in `sha256:<hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
  const PREFIX: &'static str = "sha256:";

  /// Digest of the given bytes.
  pub fn of(data: &[u8]) -> Self {
    Self(format!("{}{}", Self::PREFIX, hash_bytes(data).0))
  }

  /// The hex part, without the algorithm prefix.
  pub fn hex(&self) -> &str {
    &self.0[Self::PREFIX.len()..]
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for Digest {
  type Err = OciError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let hex = s
      .strip_prefix(Self::PREFIX)
      .ok_or_else(|| OciError::InvalidDigest(s.to_string()))?;
    let valid = hex.len() == 64 && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !valid {
      return Err(OciError::InvalidDigest(s.to_string()));
    }
    Ok(Self(s.to_string()))
  }
}

impl TryFrom<String> for Digest {
  type Error = OciError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Digest> for String {
  fn from(digest: Digest) -> Self {
    digest.0
  }
}

/// Platform as it appears inside an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
  pub architecture: String,
  pub os: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub variant: Option<String>,
}

impl PlatformSpec {
  /// Whether an index entry for this platform can run on `platform`.
  ///
  /// A target without a variant accepts any variant of its architecture.
  pub fn matches(&self, platform: &Platform) -> bool {
    self.os == platform.os.as_str()
      && self.architecture == platform.arch.as_str()
      && (platform.variant.is_none() || self.variant == platform.variant)
  }
}

impl From<&Platform> for PlatformSpec {
  fn from(platform: &Platform) -> Self {
    Self {
      architecture: platform.arch.as_str().to_string(),
      os: platform.os.as_str().to_string(),
      variant: platform.variant.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
  pub media_type: String,
  pub digest: Digest,
  pub size: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub platform: Option<PlatformSpec>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
  /// Describe `data` with the given media type.
  pub fn for_bytes(media_type: &str, data: &[u8]) -> Self {
    Self {
      media_type: media_type.to_string(),
      digest: Digest::of(data),
      size: data.len() as u64,
      platform: None,
      annotations: BTreeMap::new(),
    }
  }
}

/// Docker writes `null` for empty lists and maps.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: serde::Deserializer<'de>,
  T: Default + Deserialize<'de>,
{
  Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Runtime defaults recorded in the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
  #[serde(
    rename = "Env",
    default,
    deserialize_with = "null_as_default",
    skip_serializing_if = "Vec::is_empty"
  )]
  pub env: Vec<String>,
  #[serde(
    rename = "Entrypoint",
    default,
    deserialize_with = "null_as_default",
    skip_serializing_if = "Vec::is_empty"
  )]
  pub entrypoint: Vec<String>,
  #[serde(
    rename = "Cmd",
    default,
    deserialize_with = "null_as_default",
    skip_serializing_if = "Vec::is_empty"
  )]
  pub cmd: Vec<String>,
  #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<String>,
  #[serde(
    rename = "Labels",
    default,
    deserialize_with = "null_as_default",
    skip_serializing_if = "BTreeMap::is_empty"
  )]
  pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
  #[serde(rename = "type")]
  pub kind: String,
  pub diff_ids: Vec<Digest>,
}

/// The image config blob. Carries no `created` timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
  pub architecture: String,
  pub os: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub variant: Option<String>,
  #[serde(default)]
  pub config: ContainerConfig,
  pub rootfs: RootFs,
}

impl ImageConfig {
  pub fn new(platform: &Platform, config: ContainerConfig, diff_ids: Vec<Digest>) -> Self {
    Self {
      architecture: platform.arch.as_str().to_string(),
      os: platform.os.as_str().to_string(),
      variant: platform.variant.clone(),
      config,
      rootfs: RootFs {
        kind: "layers".to_string(),
        diff_ids,
      },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
  pub schema_version: u32,
  #[serde(default)]
  pub media_type: String,
  pub config: Descriptor,
  pub layers: Vec<Descriptor>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
  pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
    Self {
      schema_version: 2,
      media_type: MEDIA_TYPE_MANIFEST.to_string(),
      config,
      layers,
      annotations: BTreeMap::new(),
    }
  }
}

/// The manifest list published under the release tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
  pub schema_version: u32,
  #[serde(default)]
  pub media_type: String,
  pub manifests: Vec<Descriptor>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
  pub fn new(manifests: Vec<Descriptor>) -> Self {
    Self {
      schema_version: 2,
      media_type: MEDIA_TYPE_INDEX.to_string(),
      manifests,
      annotations: BTreeMap::new(),
    }
  }

  /// Platforms listed by the index, in order.
  pub fn platforms(&self) -> Vec<&PlatformSpec> {
    self.manifests.iter().filter_map(|m| m.platform.as_ref()).collect()
  }

  /// The first image manifest entry runnable on `platform`.
  pub fn select(&self, platform: &Platform) -> Option<&Descriptor> {
    self.manifests.iter().find(|m| {
      is_manifest(&m.media_type) && m.platform.as_ref().is_some_and(|p| p.matches(platform))
    })
  }
}

/// A serialized document together with its descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
  pub descriptor: Descriptor,
  pub data: Vec<u8>,
}

impl Blob {
  /// Serialize `value` and describe the resulting bytes.
  pub fn from_json<T: Serialize>(media_type: &str, value: &T) -> Result<Self, OciError> {
    let data = serde_json::to_vec(value)?;
    Ok(Self {
      descriptor: Descriptor::for_bytes(media_type, &data),
      data,
    })
  }
}
