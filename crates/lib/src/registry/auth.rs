//! `WWW-Authenticate` challenge parsing and token responses.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
  Basic {
    realm: Option<String>,
  },
  Bearer {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
  },
}

impl Challenge {
  /// Parse a `WWW-Authenticate` header value.
  pub fn parse(header: &str) -> Result<Self, RegistryError> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
    let mut params = parse_params(params);

    match scheme.to_ascii_lowercase().as_str() {
      "basic" => Ok(Self::Basic {
        realm: params.remove("realm"),
      }),
      "bearer" => {
        let realm = params
          .remove("realm")
          .ok_or_else(|| RegistryError::Challenge(format!("bearer challenge without realm: {}", header)))?;
        Ok(Self::Bearer {
          realm,
          service: params.remove("service"),
          scope: params.remove("scope"),
        })
      }
      _ => Err(RegistryError::Challenge(header.to_string())),
    }
  }
}

/// `key="value", key=value` pairs. Commas inside quotes are kept.
fn parse_params(input: &str) -> BTreeMap<String, String> {
  let mut params = BTreeMap::new();
  let mut chars = input.chars().peekable();

  loop {
    while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
      chars.next();
    }
    let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
    if key.is_empty() {
      break;
    }

    let mut value = String::new();
    if chars.peek() == Some(&'"') {
      chars.next();
      while let Some(c) = chars.next() {
        match c {
          '\\' => {
            if let Some(escaped) = chars.next() {
              value.push(escaped);
            }
          }
          '"' => break,
          _ => value.push(c),
        }
      }
    } else {
      while let Some(c) = chars.peek() {
        if *c == ',' {
          break;
        }
        value.push(*c);
        chars.next();
      }
    }

    params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
  }

  params
}

/// Token endpoint response. Registries disagree on the field name.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
  pub token: Option<String>,
  pub access_token: Option<String>,
  pub expires_in: Option<u64>,
}

impl TokenResponse {
  pub fn into_token(self) -> Option<String> {
    self.token.or(self.access_token).filter(|t| !t.is_empty())
  }
}

/// Scope requested for publishing to `repository`.
pub fn push_scope(repository: &str) -> String {
  format!("repository:{}:pull,push", repository)
}

/// Scope requested for reading base images from `repository`.
pub fn pull_scope(repository: &str) -> String {
  format!("repository:{}:pull", repository)
}
