//! Implementation of the `probeship render` command.

use std::path::Path;

use anyhow::Result;

use crate::setup::load_config;

/// Print the configured recipe as a Containerfile.
pub fn cmd_render(config: Option<&Path>) -> Result<()> {
  let config = load_config(config)?;
  print!("{}", config.recipe().render_containerfile());
  Ok(())
}
