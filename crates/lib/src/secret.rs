//! Registry credentials.
//!
//! Tokens are wrapped in [`Secret`], which has no `Display` impl and a redacted
//! `Debug` impl, so they cannot end up in a log line or a serialized report by
//! accident. The raw value is only reachable through [`Secret::expose`].

use std::fmt;

use thiserror::Error;

const REDACTED: &str = "***";

#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  /// The raw value. Only pass this to the HTTP layer.
  pub fn expose(&self) -> &str {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl fmt::Debug for Secret {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Secret({})", REDACTED)
  }
}

#[derive(Debug, Error)]
pub enum CredentialsError {
  #[error("environment variable {0} is not set")]
  Missing(String),

  #[error("environment variable {0} is empty")]
  Empty(String),
}

/// Username and token used for the registry token exchange.
#[derive(Debug, Clone)]
pub struct Credentials {
  pub username: String,
  pub password: Secret,
}

impl Credentials {
  pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
    Self {
      username: username.into(),
      password: Secret::new(password),
    }
  }

  /// Read credentials from the named environment variables.
  pub fn from_env(username_var: &str, token_var: &str) -> Result<Self, CredentialsError> {
    let username = read_var(username_var)?;
    let token = read_var(token_var)?;
    Ok(Self::new(username, token))
  }
}

fn read_var(name: &str) -> Result<String, CredentialsError> {
  let value = std::env::var(name).map_err(|_| CredentialsError::Missing(name.to_string()))?;
  if value.is_empty() {
    return Err(CredentialsError::Empty(name.to_string()));
  }
  Ok(value)
}
