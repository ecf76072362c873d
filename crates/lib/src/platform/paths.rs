//! Well-known filesystem locations.
//!
//! Every location can be overridden through a `PROBESHIP_*` environment
//! variable, which is how CI runners point the layer cache at a shared volume.

use std::path::PathBuf;

use crate::consts::{APP_NAME, CACHE_DIR_ENV, CONFIG_ENV, DEFAULT_CONFIG_FILE};

/// Returns the user's home directory
pub fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the directory for cache files for the application
pub fn cache_dir() -> PathBuf {
  if let Ok(path) = std::env::var(CACHE_DIR_ENV) {
    return PathBuf::from(path);
  }

  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Root of the filesystem layer cache.
pub fn layer_cache_dir() -> PathBuf {
  cache_dir().join("layers")
}

/// Path of the release configuration file.
///
/// `PROBESHIP_CONFIG` wins over the default `release.toml` in the working directory.
pub fn config_file() -> PathBuf {
  std::env::var(CONFIG_ENV)
    .map(PathBuf::from)
    .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn cache_dir_env_override_wins() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, Some("/shared/cache")),
        ("XDG_CACHE_HOME", Some("/xdg/cache")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/shared/cache"));
        assert_eq!(layer_cache_dir(), PathBuf::from("/shared/cache/layers"));
      },
    );
  }

  #[test]
  #[serial]
  fn xdg_cache_home_takes_precedence_over_home() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, None::<&str>),
        ("XDG_CACHE_HOME", Some("/xdg/cache")),
        ("HOME", Some("/home/ci")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/xdg/cache").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn falls_back_to_home_cache() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, None::<&str>),
        ("XDG_CACHE_HOME", None::<&str>),
        ("HOME", Some("/home/ci")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/home/ci/.cache").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn config_file_defaults_to_working_directory() {
    temp_env::with_var(CONFIG_ENV, None::<&str>, || {
      assert_eq!(config_file(), PathBuf::from(DEFAULT_CONFIG_FILE));
    });
    temp_env::with_var(CONFIG_ENV, Some("/etc/probeship.toml"), || {
      assert_eq!(config_file(), PathBuf::from("/etc/probeship.toml"));
    });
  }
}
