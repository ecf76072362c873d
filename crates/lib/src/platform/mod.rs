//! Target platforms for multi-architecture builds.
//!
//! A [`Platform`] is the `os/arch[/variant]` triple used by OCI image indexes
//! and by `--platform` flags (e.g. `linux/amd64`, `linux/arm/v7`).

pub mod arch;
pub mod os;
pub mod paths;

use std::fmt;
use std::str::FromStr;

use arch::Arch;
use os::Os;
use serde::{Deserialize, Serialize};

/// One build target: the platform an image variant is produced for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
  pub os: Os,
  pub arch: Arch,
  pub variant: Option<String>,
}

impl Platform {
  pub fn new(os: Os, arch: Arch) -> Self {
    Self { os, arch, variant: None }
  }

  pub fn with_variant(mut self, variant: &str) -> Self {
    self.variant = Some(variant.to_string());
    self
  }

  /// The Linux platform matching the running host's CPU.
  ///
  /// Returns `None` if the architecture is not supported
  pub fn current() -> Option<Self> {
    Some(Self::new(Os::Linux, Arch::current()?))
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.variant {
      Some(variant) => write!(f, "{}/{}/{}", self.os, self.arch, variant),
      None => write!(f, "{}/{}", self.os, self.arch),
    }
  }
}

impl FromStr for Platform {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts: Vec<&str> = s.split('/').collect();
    match parts.as_slice() {
      [os, arch] => Ok(Self::new(os.parse()?, arch.parse()?)),
      [os, arch, variant] if !variant.is_empty() => Ok(Self::new(os.parse()?, arch.parse()?).with_variant(variant)),
      _ => Err(format!("invalid platform '{}': expected os/arch[/variant]", s)),
    }
  }
}

impl TryFrom<String> for Platform {
  type Error = String;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Platform> for String {
  fn from(platform: Platform) -> Self {
    platform.to_string()
  }
}
