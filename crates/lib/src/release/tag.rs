//! Release tag derivation.
//!
//! A release publishes under its reference name exactly as given. Tags that
//! are not valid OCI tags are rejected, never rewritten: a silently
//! normalized tag would publish under a name nobody asked for.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::ReleaseEvent;
use crate::consts::{MAX_TAG_LEN, SHORT_SHA_LEN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
  #[error("tag is empty")]
  Empty,

  #[error("tag '{tag}' is {len} characters long, the limit is {MAX_TAG_LEN}")]
  TooLong { tag: String, len: usize },

  #[error("tag '{tag}' contains '{ch}': only letters, digits, '_', '.' and '-' are allowed")]
  InvalidCharacter { tag: String, ch: char },

  #[error("tag '{0}' must start with a letter, digit or '_'")]
  InvalidStart(String),

  #[error("manual dispatch has no commit sha to derive a tag from")]
  MissingSha,

  #[error("'{0}' is not a commit sha")]
  InvalidSha(String),

  #[error("manual dispatch has no ref to derive a tag from")]
  MissingRef,
}

/// Check `tag` against `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<(), TagError> {
  let Some(first) = tag.chars().next() else {
    return Err(TagError::Empty);
  };
  if !(first.is_ascii_alphanumeric() || first == '_') {
    return Err(TagError::InvalidStart(tag.to_string()));
  }
  if let Some(ch) = tag
    .chars()
    .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
  {
    return Err(TagError::InvalidCharacter {
      tag: tag.to_string(),
      ch,
    });
  }
  if tag.len() > MAX_TAG_LEN {
    return Err(TagError::TooLong {
      tag: tag.to_string(),
      len: tag.len(),
    });
  }
  Ok(())
}

/// How a manual dispatch, which carries no release name, is tagged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManualTagPolicy {
  /// `sha-<first 7 hex of the commit>`
  #[default]
  ShortSha,
  /// The dispatching ref name, verbatim.
  Branch,
  /// A fixed tag such as `edge`.
  Fixed(String),
}

/// The tag a run publishes under.
pub fn derive_tag(event: &ReleaseEvent, policy: &ManualTagPolicy) -> Result<String, TagError> {
  let tag = match event {
    ReleaseEvent::Released { ref_name } => ref_name.clone(),
    ReleaseEvent::ManualDispatch { git_ref, sha } => match policy {
      ManualTagPolicy::ShortSha => {
        let sha = sha.as_deref().ok_or(TagError::MissingSha)?;
        if sha.len() < SHORT_SHA_LEN || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
          return Err(TagError::InvalidSha(sha.to_string()));
        }
        format!("sha-{}", sha[..SHORT_SHA_LEN].to_ascii_lowercase())
      }
      ManualTagPolicy::Branch => git_ref.clone().ok_or(TagError::MissingRef)?,
      ManualTagPolicy::Fixed(tag) => tag.clone(),
    },
  };
  validate_tag(&tag)?;
  Ok(tag)
}
