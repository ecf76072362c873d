//! Registry access.
//!
//! A [`Registry`] is the publish target and the source of base images: it
//! issues a short-lived repository-scoped [`Session`] in exchange for
//! credentials (or anonymously, for pulls), accepts blobs and manifests, and
//! serves them back. Two implementations:
//!
//! - [`HttpRegistry`] speaks the OCI distribution API over HTTPS
//! - [`MemoryRegistry`] keeps everything in process, for dry runs and tests
//!
//! Sessions expire. [`SessionKeeper`] hands out the current session and
//! re-authenticates when it is about to lapse.

pub mod auth;
pub mod http;
pub mod memory;
mod session;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::oci::Digest;
use crate::release::tag::{TagError, validate_tag};
use crate::secret::{Credentials, Secret};

pub use http::HttpRegistry;
pub use memory::MemoryRegistry;
pub use session::{REFRESH_MARGIN, SessionKeeper};

#[derive(Debug, Error)]
pub enum RegistryError {
  /// The registry rejected the credentials or the token exchange failed.
  #[error("authentication to {registry} failed: {message}")]
  Auth { registry: String, message: String },

  #[error("unsupported authentication challenge: {0}")]
  Challenge(String),

  #[error("{method} {url} returned {status}")]
  Status { method: String, url: String, status: u16 },

  #[error("registry response is missing the {0} header")]
  MissingHeader(String),

  #[error("registry reported digest {actual}, expected {expected}")]
  DigestMismatch { expected: String, actual: String },

  #[error("invalid image reference '{0}'")]
  InvalidReference(String),

  #[error(transparent)]
  InvalidTag(#[from] TagError),

  #[error("registry request failed: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("registry rejected the request: {0}")]
  Rejected(String),
}

/// How requests in a session are authorized.
#[derive(Debug, Clone)]
pub enum Authorization {
  Anonymous,
  Basic(Credentials),
  Bearer(Secret),
}

/// An authenticated, repository-scoped registry session.
#[derive(Debug, Clone)]
pub struct Session {
  pub repository: String,
  pub authorization: Authorization,
  /// Token lifetime in seconds, when the registry reports one.
  pub expires_in: Option<u64>,
  pub issued_at: Instant,
}

impl Session {
  pub fn new(repository: &str, authorization: Authorization, expires_in: Option<u64>) -> Self {
    Self {
      repository: repository.to_string(),
      authorization,
      expires_in,
      issued_at: Instant::now(),
    }
  }

  /// Whether the token lapses within `margin` from now. Sessions without a
  /// lifetime never do.
  pub fn expires_within(&self, margin: Duration) -> bool {
    match self.expires_in {
      Some(seconds) => self.issued_at.elapsed() + margin >= Duration::from_secs(seconds),
      None => false,
    }
  }
}

/// A manifest or index as served by a registry.
#[derive(Debug, Clone)]
pub struct Manifest {
  pub media_type: String,
  pub body: Vec<u8>,
  pub digest: Digest,
}

#[async_trait]
pub trait Registry: Send + Sync {
  /// Registry host, as it appears in image references.
  fn host(&self) -> &str;

  /// Exchange credentials for a session scoped to `repository` with pull and
  /// push rights.
  async fn authenticate(&self, repository: &str, credentials: &Credentials) -> Result<Session, RegistryError>;

  /// Open an anonymous session scoped to `repository` with pull rights.
  async fn authenticate_pull(&self, repository: &str) -> Result<Session, RegistryError>;

  async fn blob_exists(&self, session: &Session, digest: &Digest) -> Result<bool, RegistryError>;

  async fn push_blob(&self, session: &Session, digest: &Digest, data: &[u8]) -> Result<(), RegistryError>;

  /// Upload a manifest under `reference` (a tag or a digest) and return its digest.
  async fn push_manifest(
    &self,
    session: &Session,
    reference: &str,
    media_type: &str,
    body: &[u8],
  ) -> Result<Digest, RegistryError>;

  /// Digest of the manifest `reference` points at, if it exists.
  async fn resolve(&self, session: &Session, reference: &str) -> Result<Option<Digest>, RegistryError>;

  /// The manifest or index `reference` points at, if it exists.
  async fn fetch_manifest(&self, session: &Session, reference: &str) -> Result<Option<Manifest>, RegistryError>;

  /// Blob content, checked against `digest`.
  async fn fetch_blob(&self, session: &Session, digest: &Digest) -> Result<Vec<u8>, RegistryError>;
}

/// `<registry-host>/<repository>:<tag>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
  pub host: String,
  pub repository: String,
  pub tag: String,
}

impl ImageReference {
  pub fn new(host: &str, repository: &str, tag: &str) -> Result<Self, RegistryError> {
    validate_repository(repository)?;
    validate_tag(tag)?;
    if host.is_empty() || host.contains('/') {
      return Err(RegistryError::InvalidReference(host.to_string()));
    }
    Ok(Self {
      host: host.to_string(),
      repository: repository.to_string(),
      tag: tag.to_string(),
    })
  }
}

impl fmt::Display for ImageReference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}:{}", self.host, self.repository, self.tag)
  }
}

impl FromStr for ImageReference {
  type Err = RegistryError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || RegistryError::InvalidReference(s.to_string());
    let (host, rest) = s.split_once('/').ok_or_else(invalid)?;
    let (repository, tag) = rest.rsplit_once(':').ok_or_else(invalid)?;
    Self::new(host, repository, tag)
  }
}

/// Repository names are lowercase path components of `[a-z0-9._-]`.
pub fn validate_repository(repository: &str) -> Result<(), RegistryError> {
  let valid = !repository.is_empty()
    && repository.split('/').all(|part| {
      !part.is_empty()
        && part
          .chars()
          .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        && part.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
    });
  if valid {
    Ok(())
  } else {
    Err(RegistryError::InvalidReference(repository.to_string()))
  }
}
