//! Release orchestration.
//!
//! A run is driven by a [`ReleaseEvent`] and walks the [`RunState`] machine:
//! derive the tag, authenticate, build every target platform, and publish the
//! images as one multi-architecture index under the tag. Any failure ends the
//! run in `Failed` without touching the tag.

pub mod event;
mod orchestrator;
pub mod publish;
pub mod report;
pub mod state;
pub mod tag;

pub use event::{EventError, ReleaseEvent};
pub use orchestrator::{Orchestrator, ReleaseError, ReleasePlan, ReleaseSettings};
pub use publish::{PublishError, PublishOutcome, build_index, publish};
pub use report::{FailureKind, ReportError, RunReport, TargetReport, TargetStatus};
pub use state::{InvalidTransition, RunState, StateMachine, Transition};
pub use tag::{ManualTagPolicy, TagError, derive_tag, validate_tag};
