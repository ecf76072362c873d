//! The trigger that starts a run.
//!
//! Events are plain values handed to the orchestrator. Reading them from the
//! GitHub Actions environment happens here, once, at the edge.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const GITHUB_EVENT_NAME: &str = "GITHUB_EVENT_NAME";
pub const GITHUB_EVENT_PATH: &str = "GITHUB_EVENT_PATH";
pub const GITHUB_REF_NAME: &str = "GITHUB_REF_NAME";
pub const GITHUB_SHA: &str = "GITHUB_SHA";

#[derive(Debug, Error)]
pub enum EventError {
  #[error("{0} is not set: not running under a release trigger")]
  MissingVar(&'static str),

  #[error("event '{0}' does not trigger a release")]
  Unsupported(String),

  #[error("release action '{0}' does not trigger a release, only 'released' does")]
  NotReleased(String),

  #[error("release event carries no tag name")]
  MissingRefName,

  #[error("failed to read event payload {path}: {source}")]
  ReadPayload {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse event payload: {0}")]
  ParsePayload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseEvent {
  /// A release was marked released. `ref_name` becomes the image tag.
  Released { ref_name: String },
  /// Someone ran the workflow by hand.
  ManualDispatch { git_ref: Option<String>, sha: Option<String> },
}

#[derive(Deserialize)]
struct Payload {
  action: Option<String>,
  release: Option<PayloadRelease>,
}

#[derive(Deserialize)]
struct PayloadRelease {
  tag_name: Option<String>,
}

impl ReleaseEvent {
  pub fn kind(&self) -> &'static str {
    match self {
      ReleaseEvent::Released { .. } => "released",
      ReleaseEvent::ManualDispatch { .. } => "manual-dispatch",
    }
  }

  /// Build the event from the variables GitHub Actions sets for a workflow run.
  pub fn from_github_env() -> Result<Self, EventError> {
    let name = std::env::var(GITHUB_EVENT_NAME).map_err(|_| EventError::MissingVar(GITHUB_EVENT_NAME))?;
    let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

    let payload = match var(GITHUB_EVENT_PATH) {
      Some(path) => Some(read_payload(Path::new(&path))?),
      None => None,
    };
    Self::from_parts(&name, payload.as_deref(), var(GITHUB_REF_NAME), var(GITHUB_SHA))
  }

  /// Build the event from its raw parts. `payload` is the webhook JSON body.
  pub fn from_parts(
    event_name: &str,
    payload: Option<&str>,
    ref_name: Option<String>,
    sha: Option<String>,
  ) -> Result<Self, EventError> {
    match event_name {
      "release" => {
        let payload: Payload = match payload {
          Some(body) => serde_json::from_str(body)?,
          None => return Err(EventError::MissingVar(GITHUB_EVENT_PATH)),
        };
        let action = payload.action.unwrap_or_default();
        if action != "released" {
          return Err(EventError::NotReleased(action));
        }
        let ref_name = payload
          .release
          .and_then(|r| r.tag_name)
          .or(ref_name)
          .ok_or(EventError::MissingRefName)?;
        Ok(ReleaseEvent::Released { ref_name })
      }
      "workflow_dispatch" => Ok(ReleaseEvent::ManualDispatch { git_ref: ref_name, sha }),
      other => Err(EventError::Unsupported(other.to_string())),
    }
  }
}

impl fmt::Display for ReleaseEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReleaseEvent::Released { ref_name } => write!(f, "released {}", ref_name),
      ReleaseEvent::ManualDispatch { git_ref, sha } => write!(
        f,
        "manual dispatch on {} ({})",
        git_ref.as_deref().unwrap_or("unknown ref"),
        sha.as_deref().unwrap_or("unknown commit")
      ),
    }
  }
}

fn read_payload(path: &Path) -> Result<String, EventError> {
  std::fs::read_to_string(path).map_err(|source| EventError::ReadPayload {
    path: path.to_path_buf(),
    source,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use tempfile::TempDir;

  const RELEASED: &str = r#"{"action":"released","release":{"tag_name":"v2.0.0"}}"#;

  #[test]
  fn released_payload_yields_tag_name() {
    let event = ReleaseEvent::from_parts("release", Some(RELEASED), Some("ignored".into()), None).unwrap();
    assert_eq!(
      event,
      ReleaseEvent::Released {
        ref_name: "v2.0.0".to_string()
      }
    );
    assert_eq!(event.kind(), "released");
  }

  #[test]
  fn other_release_actions_do_not_qualify() {
    for action in ["published", "created", "prereleased"] {
      let body = format!(r#"{{"action":"{}","release":{{"tag_name":"v1"}}}}"#, action);
      let err = ReleaseEvent::from_parts("release", Some(&body), None, None).unwrap_err();
      assert!(matches!(err, EventError::NotReleased(ref a) if a == action));
    }
  }

  #[test]
  fn release_falls_back_to_ref_name() {
    let event = ReleaseEvent::from_parts("release", Some(r#"{"action":"released"}"#), Some("v1.2.3".into()), None).unwrap();
    assert_eq!(
      event,
      ReleaseEvent::Released {
        ref_name: "v1.2.3".to_string()
      }
    );
    assert!(matches!(
      ReleaseEvent::from_parts("release", Some(r#"{"action":"released"}"#), None, None),
      Err(EventError::MissingRefName)
    ));
  }

  #[test]
  fn dispatch_and_unsupported_events() {
    let event = ReleaseEvent::from_parts("workflow_dispatch", None, Some("main".into()), Some("abc1234".into())).unwrap();
    assert_eq!(event.kind(), "manual-dispatch");
    assert_eq!(event.to_string(), "manual dispatch on main (abc1234)");
    assert!(matches!(
      ReleaseEvent::from_parts("push", None, None, None),
      Err(EventError::Unsupported(_))
    ));
  }

  #[test]
  #[serial]
  fn reads_github_environment() {
    let temp = TempDir::new().unwrap();
    let payload = temp.path().join("event.json");
    std::fs::write(&payload, RELEASED).unwrap();

    temp_env::with_vars(
      [
        (GITHUB_EVENT_NAME, Some("release")),
        (GITHUB_EVENT_PATH, payload.to_str()),
        (GITHUB_REF_NAME, Some("v2.0.0")),
        (GITHUB_SHA, Some("3f9a1c0d2e4b")),
      ],
      || {
        assert_eq!(
          ReleaseEvent::from_github_env().unwrap(),
          ReleaseEvent::Released {
            ref_name: "v2.0.0".to_string()
          }
        );
      },
    );
  }

  #[test]
  #[serial]
  fn missing_event_name_is_an_error() {
    temp_env::with_var_unset(GITHUB_EVENT_NAME, || {
      assert!(matches!(
        ReleaseEvent::from_github_env(),
        Err(EventError::MissingVar(GITHUB_EVENT_NAME))
      ));
    });
  }
}
