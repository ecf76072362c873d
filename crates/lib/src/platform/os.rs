use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operating systems an image can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
  Linux,
}

impl Os {
  /// Returns the OCI os identifier
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
    }
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for Os {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "linux" => Ok(Self::Linux),
      other => Err(format!("unsupported operating system: {}", other)),
    }
  }
}
