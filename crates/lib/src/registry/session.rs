//! Session reuse and renewal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::{Registry, RegistryError, Session};
use crate::secret::Credentials;

/// Sessions this close to expiry are renewed before use.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// Hands out a session on one repository, re-authenticating when the current
/// one is missing or about to lapse.
///
/// Credentials are held for renewal only. They are never logged.
pub struct SessionKeeper {
  registry: Arc<dyn Registry>,
  repository: String,
  credentials: Option<Credentials>,
  current: Mutex<Option<Session>>,
}

impl SessionKeeper {
  /// Push sessions on `repository`, authenticated with `credentials`.
  pub fn push(registry: Arc<dyn Registry>, repository: &str, credentials: Credentials) -> Self {
    Self {
      registry,
      repository: repository.to_string(),
      credentials: Some(credentials),
      current: Mutex::new(None),
    }
  }

  /// Anonymous pull sessions on `repository`.
  pub fn pull(registry: Arc<dyn Registry>, repository: &str) -> Self {
    Self {
      registry,
      repository: repository.to_string(),
      credentials: None,
      current: Mutex::new(None),
    }
  }

  pub fn registry(&self) -> &dyn Registry {
    self.registry.as_ref()
  }

  pub fn repository(&self) -> &str {
    &self.repository
  }

  /// The current session, authenticating first when needed.
  pub async fn session(&self) -> Result<Session, RegistryError> {
    let mut current = self.current.lock().await;
    if let Some(session) = current.as_ref() {
      if !session.expires_within(REFRESH_MARGIN) {
        return Ok(session.clone());
      }
      debug!(repository = %self.repository, "session about to expire, re-authenticating");
    }

    let session = match &self.credentials {
      Some(credentials) => self.registry.authenticate(&self.repository, credentials).await?,
      None => self.registry.authenticate_pull(&self.repository).await?,
    };
    *current = Some(session.clone());
    Ok(session)
  }
}
