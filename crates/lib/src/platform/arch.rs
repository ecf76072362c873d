use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// CPU architectures an image can be built for, named as OCI image configs name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
  Amd64,
  Arm64,
  Arm,
  Ppc64le,
  S390x,
}

impl Arch {
  /// Detect the architecture of the running host.
  pub fn current() -> Option<Self> {
    match std::env::consts::ARCH {
      "x86_64" => Some(Self::Amd64),
      "aarch64" => Some(Self::Arm64),
      "arm" => Some(Self::Arm),
      "powerpc64" => Some(Self::Ppc64le),
      "s390x" => Some(Self::S390x),
      _ => None,
    }
  }

  /// Returns the OCI architecture identifier
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Amd64 => "amd64",
      Self::Arm64 => "arm64",
      Self::Arm => "arm",
      Self::Ppc64le => "ppc64le",
      Self::S390x => "s390x",
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for Arch {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "amd64" | "x86_64" => Ok(Self::Amd64),
      "arm64" | "aarch64" => Ok(Self::Arm64),
      "arm" => Ok(Self::Arm),
      "ppc64le" => Ok(Self::Ppc64le),
      "s390x" => Ok(Self::S390x),
      other => Err(format!("unsupported architecture: {}", other)),
    }
  }
}
