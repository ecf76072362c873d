pub const APP_NAME: &str = "probeship";

/// Overrides the cache root (shared layer cache on CI runners).
pub const CACHE_DIR_ENV: &str = "PROBESHIP_CACHE_DIR";

/// Overrides the path of the release configuration file.
pub const CONFIG_ENV: &str = "PROBESHIP_CONFIG";

pub const DEFAULT_CONFIG_FILE: &str = "release.toml";

/// 1980-01-01T00:00:00Z, the ZIP epoch. Used for every timestamp written into a layer.
pub const SOURCE_DATE_EPOCH: u64 = 315_532_800;

/// Characters of a git commit sha kept for manual-dispatch tags.
pub const SHORT_SHA_LEN: usize = 7;

/// Maximum length of an OCI tag.
pub const MAX_TAG_LEN: usize = 128;
