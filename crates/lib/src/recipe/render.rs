//! Containerfile rendering.

use std::collections::BTreeMap;
use std::fmt::Write;

use super::types::ImageRecipe;

pub const LABEL_BASE_NAME: &str = "org.opencontainers.image.base.name";
pub const LABEL_BASE_DIGEST: &str = "org.opencontainers.image.base.digest";
pub const LABEL_VERSION: &str = "org.opencontainers.image.version";
pub const LABEL_CONFIG_PATH: &str = "io.probeship.runtime.config-path";
pub const LABEL_NETWORK: &str = "io.probeship.runtime.network";

impl ImageRecipe {
  /// Labels every image built from this recipe carries, independent of the context.
  pub fn static_labels(&self) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_BASE_NAME.to_string(), self.base.to_string());
    if let Some(runtime) = &self.runtime {
      labels.insert(LABEL_CONFIG_PATH.to_string(), runtime.config_path.clone());
      labels.insert(LABEL_NETWORK.to_string(), runtime.network.as_str().to_string());
    }
    labels
  }

  /// Render the recipe as an equivalent Containerfile.
  ///
  /// Runtime-contract labels are emitted right before the final `CMD`.
  pub fn render_containerfile(&self) -> String {
    let mut out = String::new();
    let instructions = self.instructions();
    let (cmd, body) = match instructions.split_last() {
      Some((last, body)) if matches!(last, super::Instruction::Cmd { .. }) => (Some(last), body),
      _ => (None, instructions.as_slice()),
    };

    let _ = writeln!(out, "FROM {}", self.base);
    for instruction in body {
      let _ = writeln!(out, "{}", instruction.describe());
    }
    if let Some(runtime) = &self.runtime {
      let _ = writeln!(out, "LABEL {}=\"{}\"", LABEL_CONFIG_PATH, runtime.config_path);
      let _ = writeln!(out, "LABEL {}=\"{}\"", LABEL_NETWORK, runtime.network.as_str());
    }
    if let Some(cmd) = cmd {
      let _ = writeln!(out, "{}", cmd.describe());
    }
    out
  }
}
