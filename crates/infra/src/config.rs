//! Configuration loading and representation.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::step::ChunkConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("USE_PERSISTENT_STORES is set but DATABASE_URL is missing")]
    MissingDatabaseUrl,
}

/// Process configuration, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    pub bind_addr: String,
    /// Where uploaded import files are staged.
    pub upload_dir: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: ChunkConfig::DEFAULT_CHUNK_SIZE,
            database_url: None,
            use_persistent_stores: false,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            upload_dir: env::temp_dir(),
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset and blank values take the
    /// default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let chunk_size = match get("BATCH_CHUNK_SIZE") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::Invalid {
                        key: "BATCH_CHUNK_SIZE",
                        message: format!("expected a positive integer, got {raw:?}"),
                    });
                }
                Ok(n) => n,
            },
            None => defaults.chunk_size,
        };

        let database_url = get("DATABASE_URL");
        let use_persistent_stores = match get("USE_PERSISTENT_STORES") {
            Some(raw) => parse_bool("USE_PERSISTENT_STORES", &raw)?,
            None => false,
        };
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        Ok(Self {
            chunk_size,
            database_url,
            use_persistent_stores,
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            upload_dir: get("UPLOAD_DIR").map(PathBuf::from).unwrap_or(defaults.upload_dir),
        })
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig::new(self.chunk_size)
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            message: format!("expected a boolean, got {raw:?}"),
        }),
    }
}
