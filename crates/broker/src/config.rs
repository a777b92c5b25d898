use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_TIMEOUT_MAX_SECONDS: u64 = 120;
const DEFAULT_STREAM_MAX_BYTES: usize = 32_768;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {key} is not set")]
    MissingEnv { key: &'static str },
    #[error("invalid value `{value}` for {key}: expected an integer")]
    InvalidInt { key: &'static str, value: String },
}

/// Broker configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base URL of the upstream Zoekt HTTP backend; passed through to
    /// payload children via the environment allow-list.
    pub zoekt_api_url: String,
    /// Root of the payload tree: the manifest, the workflow scripts, and the
    /// `runtime/` helper directory mirrored into every sandbox.
    pub source_root: PathBuf,
    pub manifest_path: PathBuf,
    pub execution_timeout_default: u64,
    pub execution_timeout_max: u64,
    pub execution_stdout_max_bytes: usize,
    pub execution_stderr_max_bytes: usize,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let zoekt_api_url = required_env("ZOEKT_API_URL")?;
        let source_root = PathBuf::from(
            std::env::var("ZOEKT_BROKER_ROOT").unwrap_or_else(|_| "payloads".to_string()),
        );
        Ok(Self {
            manifest_path: source_root.join("manifest.yaml"),
            source_root,
            zoekt_api_url,
            execution_timeout_default: int_env("EXECUTION_TIMEOUT_DEFAULT", DEFAULT_TIMEOUT_SECONDS)?,
            execution_timeout_max: int_env("EXECUTION_TIMEOUT_MAX", DEFAULT_TIMEOUT_MAX_SECONDS)?,
            execution_stdout_max_bytes: int_env(
                "EXECUTION_STDOUT_MAX_BYTES",
                DEFAULT_STREAM_MAX_BYTES as u64,
            )? as usize,
            execution_stderr_max_bytes: int_env(
                "EXECUTION_STDERR_MAX_BYTES",
                DEFAULT_STREAM_MAX_BYTES as u64,
            )? as usize,
        })
    }

    /// Configuration rooted at an explicit payload directory, with defaults
    /// everywhere else. Used by tests and embedders that skip the
    /// environment.
    pub fn with_source_root(source_root: impl Into<PathBuf>) -> Self {
        let source_root = source_root.into();
        Self {
            zoekt_api_url: String::new(),
            manifest_path: source_root.join("manifest.yaml"),
            source_root,
            execution_timeout_default: DEFAULT_TIMEOUT_SECONDS,
            execution_timeout_max: DEFAULT_TIMEOUT_MAX_SECONDS,
            execution_stdout_max_bytes: DEFAULT_STREAM_MAX_BYTES,
            execution_stderr_max_bytes: DEFAULT_STREAM_MAX_BYTES,
        }
    }
}

fn required_env(key: &'static str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnv { key }),
    }
}

fn int_env(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidInt { key, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_source_root_fills_in_defaults() {
        let config = BrokerConfig::with_source_root("/srv/payloads");
        assert_eq!(config.manifest_path, PathBuf::from("/srv/payloads/manifest.yaml"));
        assert_eq!(config.execution_timeout_default, 30);
        assert_eq!(config.execution_timeout_max, 120);
        assert_eq!(config.execution_stdout_max_bytes, 32_768);
    }
}
