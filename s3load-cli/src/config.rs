//! Configuration for the `s3load` binary.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `S3LOAD__`)
//! 2. The cache variables `LT_CACHE_SERVER`, `LT_CACHE_SERV_PORT` and `LT_CACHE_SERV_DB`
//! 3. YAML configuration file (specified via `-c` or `--config`, or the `LOCUST_CONFIG` variable)
//! 4. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `S3LOAD__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `S3LOAD__DATA__CACHE_RESULT=true` enables the lifecycle cache
//! - `S3LOAD__CACHE__SERVER=redis.local` sets the cache host
//! - `S3LOAD__LOGGING__LEVEL=debug` sets the log level
//!
//! # YAML Configuration File
//!
//! ```yaml
//! data:
//!   buckets: [bucket-0]
//!   object_prefix: obj-
//!   cache_result: true
//!   weights:
//!     small: { LOW: 1KiB, HIGH: 64KiB, WEIGHT: 1 }
//!
//!   upload_limit:
//!     limited: true
//!     size_limit: 1TiB
//!
//! cache:
//!   server: redis.local
//!
//! counter:
//!   server: redis.local
//!   db: 1
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use s3load_factory::{CacheConfig, DataConfig};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "S3LOAD__";

/// Environment variable naming the configuration file if no path is passed explicitly.
const CONFIG_PATH_ENV: &str = "LOCUST_CONFIG";

/// Cache variables understood for compatibility with existing load test deployments.
const CACHE_ENV_VARS: [(&str, &str); 3] = [
    ("LT_CACHE_SERVER", "cache.server"),
    ("LT_CACHE_SERV_PORT", "cache.port"),
    ("LT_CACHE_SERV_DB", "cache.db"),
];

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output without colors.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr. The `RUST_LOG` environment variable overrides the level.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// # Default
    ///
    /// `INFO`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Generated objects and lifecycle tracking.
    pub data: DataConfig,

    /// Connection to the key-value store backing the lifecycle cache.
    pub cache: CacheConfig,

    /// Connection to the key-value store holding the upload counter.
    ///
    /// Only used if `data.upload_limit.limited` is set.
    pub counter: CacheConfig,

    /// Log verbosity and format.
    pub logging: Logging,
}

impl Config {
    /// Loads and validates configuration.
    ///
    /// If `path` is `None`, the file named by `LOCUST_CONFIG` is used if that variable is set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = &path {
            figment = figment.merge(Yaml::file_exact(path));
        }

        let legacy_cache = Env::raw()
            .only(&CACHE_ENV_VARS.map(|(var, _)| var))
            .map(|var| {
                CACHE_ENV_VARS
                    .iter()
                    .find(|(name, _)| var.as_str().eq_ignore_ascii_case(name))
                    .map_or_else(|| var.as_str().to_owned(), |(_, key)| (*key).to_owned())
                    .into()
            });

        let config: Config = figment
            .merge(legacy_cache)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("failed to load configuration")?;

        config
            .data
            .validate()
            .context("invalid data configuration")?;

        Ok(config)
    }
}
