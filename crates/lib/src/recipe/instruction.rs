//! Lowered recipe form.
//!
//! Authoring steps expand into instructions, one per cache unit. A
//! dependencies step becomes two instructions (stage the manifest, run the
//! install) so the install layer's key only covers the manifest.

use serde::{Deserialize, Serialize};

use super::types::{ImageRecipe, Step};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Instruction {
  Run { command: String },
  Copy { source: String, dest: String },
  Workdir { path: String },
  Env { key: String, value: String },
  Label { key: String, value: String },
  Cmd { argv: Vec<String> },
}

impl Instruction {
  /// Whether executing the instruction yields a filesystem layer.
  pub fn produces_layer(&self) -> bool {
    matches!(self, Self::Run { .. } | Self::Copy { .. })
  }

  /// The context path this instruction reads, if any.
  pub fn context_source(&self) -> Option<&str> {
    match self {
      Self::Copy { source, .. } => Some(source),
      _ => None,
    }
  }

  /// Containerfile line for this instruction.
  pub fn describe(&self) -> String {
    match self {
      Self::Run { command } => format!("RUN {}", command),
      Self::Copy { source, dest } => format!("COPY {} {}", source, dest),
      Self::Workdir { path } => format!("WORKDIR {}", path),
      Self::Env { key, value } => format!("ENV {}={}", key, quote(value)),
      Self::Label { key, value } => format!("LABEL {}={}", key, quote(value)),
      Self::Cmd { argv } => {
        let items: Vec<String> = argv.iter().map(|a| quote(a)).collect();
        format!("CMD [{}]", items.join(", "))
      }
    }
  }
}

fn quote(value: &str) -> String {
  format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

impl ImageRecipe {
  /// Expand authoring steps into instructions, preserving order.
  pub fn instructions(&self) -> Vec<Instruction> {
    let mut out = Vec::new();

    for step in &self.steps {
      match step {
        Step::SystemPackages { packages, manager } => out.push(Instruction::Run {
          command: manager.install_command(packages),
        }),
        Step::Dependencies { manifest, dest, install } => {
          out.push(Instruction::Copy {
            source: manifest.clone(),
            dest: dest.clone(),
          });
          out.push(Instruction::Run {
            command: install.clone(),
          });
        }
        Step::Copy { source, dest } => out.push(Instruction::Copy {
          source: source.clone(),
          dest: dest.clone(),
        }),
        Step::Workdir { path } => out.push(Instruction::Workdir { path: path.clone() }),
        Step::Env { vars } => {
          for (key, value) in vars {
            out.push(Instruction::Env {
              key: key.clone(),
              value: value.clone(),
            });
          }
        }
        Step::Label { labels } => {
          for (key, value) in labels {
            out.push(Instruction::Label {
              key: key.clone(),
              value: value.clone(),
            });
          }
        }
        Step::Cmd { argv } => out.push(Instruction::Cmd { argv: argv.clone() }),
      }
    }

    out
  }
}
