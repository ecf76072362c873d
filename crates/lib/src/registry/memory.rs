//! In-process registry.
//!
//! Stores blobs and manifests in memory and records every write in order.
//! Used by `release --dry-run` and by tests that check publish ordering,
//! inject a failing write or let tokens expire.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Authorization, Manifest, Registry, RegistryError, Session};
use crate::oci::Digest;
use crate::secret::{Credentials, Secret};

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// One write accepted by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upload {
  Blob(Digest),
  Manifest { reference: String, digest: Digest },
}

#[derive(Debug, Default)]
struct State {
  blobs: BTreeMap<Digest, Vec<u8>>,
  /// Keyed by (repository, reference). Tagged manifests are also stored
  /// under their digest.
  manifests: BTreeMap<(String, String), Manifest>,
  writes: Vec<Upload>,
}

#[derive(Debug)]
pub struct MemoryRegistry {
  host: String,
  /// Accepted username and token. `None` accepts anyone.
  accept: Option<(String, Secret)>,
  /// References whose manifest upload is rejected.
  reject_manifests: HashSet<String>,
  token_lifetime: Duration,
  sessions_issued: AtomicUsize,
  state: Mutex<State>,
}

impl MemoryRegistry {
  pub fn new(host: &str) -> Self {
    Self {
      host: host.to_string(),
      accept: None,
      reject_manifests: HashSet::new(),
      token_lifetime: DEFAULT_TOKEN_LIFETIME,
      sessions_issued: AtomicUsize::new(0),
      state: Mutex::new(State::default()),
    }
  }

  /// Only accept these credentials.
  pub fn with_credentials(mut self, username: &str, token: &str) -> Self {
    self.accept = Some((username.to_string(), Secret::new(token)));
    self
  }

  /// Reject manifest uploads to `reference`.
  pub fn reject_manifest(mut self, reference: &str) -> Self {
    self.reject_manifests.insert(reference.to_string());
    self
  }

  /// Issue tokens valid for `lifetime`. Requests made with an expired token
  /// are rejected.
  pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
    self.token_lifetime = lifetime;
    self
  }

  /// Number of sessions handed out so far.
  pub fn sessions_issued(&self) -> usize {
    self.sessions_issued.load(Ordering::SeqCst)
  }

  pub async fn manifest(&self, repository: &str, reference: &str) -> Option<Manifest> {
    let state = self.state.lock().await;
    state
      .manifests
      .get(&(repository.to_string(), reference.to_string()))
      .cloned()
  }

  pub async fn blob(&self, digest: &Digest) -> Option<Vec<u8>> {
    self.state.lock().await.blobs.get(digest).cloned()
  }

  /// Every accepted write, oldest first.
  pub async fn writes(&self) -> Vec<Upload> {
    self.state.lock().await.writes.clone()
  }

  fn auth_error(&self, message: &str) -> RegistryError {
    RegistryError::Auth {
      registry: self.host.clone(),
      message: message.to_string(),
    }
  }

  fn issue(&self, repository: &str, authorization: Authorization) -> Session {
    self.sessions_issued.fetch_add(1, Ordering::SeqCst);
    Session::new(repository, authorization, Some(self.token_lifetime.as_secs()))
  }

  fn check(&self, session: &Session) -> Result<(), RegistryError> {
    if let Some(seconds) = session.expires_in
      && session.issued_at.elapsed() >= Duration::from_secs(seconds)
    {
      return Err(self.auth_error("token expired"));
    }
    Ok(())
  }

  fn check_push(&self, session: &Session) -> Result<(), RegistryError> {
    self.check(session)?;
    if matches!(session.authorization, Authorization::Anonymous) {
      return Err(self.auth_error("anonymous sessions cannot push"));
    }
    Ok(())
  }
}

#[async_trait]
impl Registry for MemoryRegistry {
  fn host(&self) -> &str {
    &self.host
  }

  async fn authenticate(&self, repository: &str, credentials: &Credentials) -> Result<Session, RegistryError> {
    if let Some((username, token)) = &self.accept
      && (credentials.username != *username || credentials.password != *token)
    {
      return Err(self.auth_error("credentials rejected"));
    }
    let token = format!("session-{}-{}", repository, self.sessions_issued());
    Ok(self.issue(repository, Authorization::Bearer(Secret::new(token))))
  }

  async fn authenticate_pull(&self, repository: &str) -> Result<Session, RegistryError> {
    Ok(self.issue(repository, Authorization::Anonymous))
  }

  async fn blob_exists(&self, session: &Session, digest: &Digest) -> Result<bool, RegistryError> {
    self.check(session)?;
    Ok(self.state.lock().await.blobs.contains_key(digest))
  }

  async fn push_blob(&self, session: &Session, digest: &Digest, data: &[u8]) -> Result<(), RegistryError> {
    self.check_push(session)?;
    let actual = Digest::of(data);
    if actual != *digest {
      return Err(RegistryError::DigestMismatch {
        expected: digest.to_string(),
        actual: actual.to_string(),
      });
    }
    let mut state = self.state.lock().await;
    state.blobs.insert(digest.clone(), data.to_vec());
    state.writes.push(Upload::Blob(digest.clone()));
    Ok(())
  }

  async fn push_manifest(
    &self,
    session: &Session,
    reference: &str,
    media_type: &str,
    body: &[u8],
  ) -> Result<Digest, RegistryError> {
    self.check_push(session)?;
    if self.reject_manifests.contains(reference) {
      return Err(RegistryError::Rejected(format!("manifest upload to {} refused", reference)));
    }
    let digest = Digest::of(body);
    let stored = Manifest {
      media_type: media_type.to_string(),
      body: body.to_vec(),
      digest: digest.clone(),
    };
    let mut state = self.state.lock().await;
    state
      .manifests
      .insert((session.repository.clone(), digest.to_string()), stored.clone());
    state
      .manifests
      .insert((session.repository.clone(), reference.to_string()), stored);
    state.writes.push(Upload::Manifest {
      reference: reference.to_string(),
      digest: digest.clone(),
    });
    Ok(digest)
  }

  async fn resolve(&self, session: &Session, reference: &str) -> Result<Option<Digest>, RegistryError> {
    Ok(self.fetch_manifest(session, reference).await?.map(|m| m.digest))
  }

  async fn fetch_manifest(&self, session: &Session, reference: &str) -> Result<Option<Manifest>, RegistryError> {
    self.check(session)?;
    let state = self.state.lock().await;
    Ok(
      state
        .manifests
        .get(&(session.repository.clone(), reference.to_string()))
        .cloned(),
    )
  }

  async fn fetch_blob(&self, session: &Session, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
    self.check(session)?;
    self
      .state
      .lock()
      .await
      .blobs
      .get(digest)
      .cloned()
      .ok_or_else(|| RegistryError::Status {
        method: "GET".to_string(),
        url: format!("{}/v2/{}/blobs/{}", self.host, session.repository, digest),
        status: 404,
      })
  }
}
