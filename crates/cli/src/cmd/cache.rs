use std::path::Path;

use anyhow::{Context, Result};

use probeship_lib::cache::FsCache;

use crate::output::{OutputFormat, format_bytes, print_json, print_stat, print_success};
use crate::setup::load_config;

/// The configured cache, or the default location when there is no config file.
fn open_cache(config: Option<&Path>) -> Result<FsCache> {
  match load_config(config) {
    Ok(config) => Ok(FsCache::new(config.cache_dir())),
    Err(_) if config.is_none() => Ok(FsCache::default_location()),
    Err(err) => Err(err),
  }
}

pub fn cmd_cache_info(config: Option<&Path>, output: OutputFormat) -> Result<()> {
  let cache = open_cache(config)?;
  let stats = cache.stats().context("Failed to read layer cache")?;

  if output.is_json() {
    print_json(&serde_json::json!({ "path": cache.root(), "stats": stats }))?;
  } else {
    println!("Layer cache: {}", cache.root().display());
    print_stat("Entries", &stats.entries.to_string());
    print_stat("Blobs", &stats.blobs.to_string());
    print_stat("Size", &format_bytes(stats.bytes));
  }
  Ok(())
}

pub fn cmd_cache_clear(config: Option<&Path>, output: OutputFormat) -> Result<()> {
  let cache = open_cache(config)?;
  let removed = cache.clear().context("Failed to clear layer cache")?;

  if output.is_json() {
    print_json(&removed)?;
  } else {
    print_success("Layer cache cleared");
    print_stat("Entries removed", &removed.entries.to_string());
    print_stat("Space freed", &format_bytes(removed.bytes));
  }
  Ok(())
}
