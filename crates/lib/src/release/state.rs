//! Run lifecycle.
//!
//! ```text
//! Idle -> Triggered -> Authenticated -> Building -> AllTargetsReady -> Publishing -> Published
//!            |              |              |                              |
//!            +--------------+--------------+------------> Failed <--------+
//! ```
//!
//! `AllTargetsReady` is only entered once every target has built. There is no
//! edge out of `Building` to `Publishing`, so a partial build can never reach
//! the registry.

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
  Idle,
  Triggered,
  Authenticated,
  Building,
  AllTargetsReady,
  Publishing,
  Published,
  Failed,
}

impl RunState {
  pub fn is_terminal(self) -> bool {
    matches!(self, RunState::Published | RunState::Failed)
  }

  pub fn can_transition_to(self, next: RunState) -> bool {
    use RunState::*;
    matches!(
      (self, next),
      (Idle, Triggered)
        | (Triggered, Authenticated)
        | (Authenticated, Building)
        | (Building, AllTargetsReady)
        | (AllTargetsReady, Publishing)
        | (Publishing, Published)
        | (Triggered | Authenticated | Building | Publishing, Failed)
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      RunState::Idle => "idle",
      RunState::Triggered => "triggered",
      RunState::Authenticated => "authenticated",
      RunState::Building => "building",
      RunState::AllTargetsReady => "all-targets-ready",
      RunState::Publishing => "publishing",
      RunState::Published => "published",
      RunState::Failed => "failed",
    }
  }
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
  pub from: RunState,
  pub to: RunState,
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
  pub from: RunState,
  pub to: RunState,
  /// Milliseconds since the machine was created.
  pub at_ms: u64,
}

#[derive(Debug)]
pub struct StateMachine {
  state: RunState,
  history: Vec<Transition>,
  started: Instant,
}

impl Default for StateMachine {
  fn default() -> Self {
    Self::new()
  }
}

impl StateMachine {
  pub fn new() -> Self {
    Self {
      state: RunState::Idle,
      history: Vec::new(),
      started: Instant::now(),
    }
  }

  pub fn state(&self) -> RunState {
    self.state
  }

  pub fn history(&self) -> &[Transition] {
    &self.history
  }

  pub fn elapsed_ms(&self) -> u64 {
    self.started.elapsed().as_millis() as u64
  }

  pub fn advance(&mut self, to: RunState) -> Result<(), InvalidTransition> {
    let from = self.state;
    if !from.can_transition_to(to) {
      return Err(InvalidTransition { from, to });
    }
    tracing::debug!(%from, %to, "run state");
    self.history.push(Transition {
      from,
      to,
      at_ms: self.elapsed_ms(),
    });
    self.state = to;
    Ok(())
  }

  /// Move to `Failed` if the current state allows it. Returns whether it did.
  pub fn fail(&mut self) -> bool {
    self.advance(RunState::Failed).is_ok()
  }
}
