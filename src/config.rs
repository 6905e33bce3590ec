//! Host settings.
//!
//! Values come from a [`ConfigSource`]: the process environment (optionally
//! seeded from a `.env` file) in the binary, a plain map in tests. The runtime
//! keys share their names with the variables a child context reads, so one
//! `.env` configures both sides.

use std::{env, path::Path, path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use extension_sdk::{
    frame::DEFAULT_MAX_FRAME_LEN,
    message::LogLevel,
    reconciler::DEFAULT_COMMIT_INTERVAL,
    runtime::{RuntimeConfig, COMMIT_INTERVAL_ENV, DEFAULT_REQUEST_TIMEOUT, MAX_FRAME_BYTES_ENV, REQUEST_TIMEOUT_ENV},
};
use tracing::{info, warn};

pub const COMMIT_INTERVAL_KEY: &str = COMMIT_INTERVAL_ENV;
pub const REQUEST_TIMEOUT_KEY: &str = REQUEST_TIMEOUT_ENV;
pub const MAX_FRAME_BYTES_KEY: &str = MAX_FRAME_BYTES_ENV;
pub const LOG_DIR_KEY: &str = "EXTENSION_HOST_LOG_DIR";
pub const LOG_LEVEL_KEY: &str = "EXTENSION_HOST_LOG_LEVEL";

#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
}

/// Process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig;

impl EnvConfig {
    /// Loads `env_file` into the environment first when given. Variables that
    /// are already set win over the file.
    pub fn new(env_file: Option<&Path>) -> Self {
        if let Some(path) = env_file {
            match dotenvy::from_path(path) {
                Ok(()) => info!("Loaded .env from {}", path.display()),
                Err(err) => warn!(error = %err, "could not load .env from {}", path.display()),
            }
        }
        Self
    }
}

#[async_trait]
impl ConfigSource for EnvConfig {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

#[derive(Debug, Default)]
pub struct MapConfig {
    map: DashMap<String, String>,
}

impl MapConfig {
    pub fn with(self, key: &str, value: &str) -> Self {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ConfigSource for MapConfig {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }
}

/// Host settings resolved from a [`ConfigSource`]. Missing or malformed keys
/// fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub commit_interval: Duration,
    pub request_timeout: Duration,
    pub max_frame_bytes: usize,
    pub log_dir: Option<PathBuf>,
    pub log_level: LogLevel,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_LEN,
            log_dir: None,
            log_level: LogLevel::Info,
        }
    }
}

impl HostConfig {
    pub async fn load(source: &dyn ConfigSource) -> Self {
        let defaults = Self::default();
        let ms = |d: Duration| d.as_millis() as u64;
        Self {
            commit_interval: Duration::from_millis(
                parse_or(source, COMMIT_INTERVAL_KEY, ms(defaults.commit_interval)).await,
            ),
            request_timeout: Duration::from_millis(
                parse_or(source, REQUEST_TIMEOUT_KEY, ms(defaults.request_timeout)).await,
            ),
            max_frame_bytes: parse_or(source, MAX_FRAME_BYTES_KEY, defaults.max_frame_bytes).await,
            log_dir: source.get(LOG_DIR_KEY).await.filter(|d| !d.trim().is_empty()).map(PathBuf::from),
            log_level: parse_or(source, LOG_LEVEL_KEY, defaults.log_level).await,
        }
    }

    /// What every execution context runs with. Child processes receive it
    /// through their environment.
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            commit_interval: self.commit_interval,
            request_timeout: self.request_timeout,
            max_frame_len: self.max_frame_bytes,
        }
    }
}

async fn parse_or<T: FromStr>(source: &dyn ConfigSource, key: &str, default: T) -> T {
    match source.get(key).await {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring malformed setting");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn defaults_when_nothing_is_set() {
        let host = HostConfig::load(&MapConfig::default()).await;
        assert_eq!(host, HostConfig::default());
        assert_eq!(host.commit_interval, Duration::from_millis(16));
        assert_eq!(host.request_timeout, Duration::from_millis(30_000));
        assert_eq!(host.max_frame_bytes, 16 * 1024 * 1024);
    }

    #[tokio::test]
    async fn reads_overrides_and_skips_garbage() {
        let source = MapConfig::default()
            .with(COMMIT_INTERVAL_KEY, "40")
            .with(REQUEST_TIMEOUT_KEY, "soon")
            .with(MAX_FRAME_BYTES_KEY, "1024")
            .with(LOG_DIR_KEY, "/tmp/ext-logs")
            .with(LOG_LEVEL_KEY, "DEBUG");

        let host = HostConfig::load(&source).await;
        assert_eq!(host.commit_interval, Duration::from_millis(40));
        assert_eq!(host.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(host.max_frame_bytes, 1024);
        assert_eq!(host.log_dir, Some(PathBuf::from("/tmp/ext-logs")));
        assert_eq!(host.log_level, LogLevel::Debug);
    }

    #[tokio::test]
    async fn runtime_settings_reach_children_unchanged() {
        let source = MapConfig::default().with(COMMIT_INTERVAL_KEY, "40").with(REQUEST_TIMEOUT_KEY, "250");
        let runtime = HostConfig::load(&source).await.runtime();

        let vars = runtime.env_vars();
        let child = RuntimeConfig::from_lookup(|key| vars.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone()));
        assert_eq!(child, runtime);
        assert_eq!(child.request_timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn env_file_seeds_the_environment() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "EXTENSION_HOST_TEST_FROM_FILE=abc123\n").unwrap();

        let source = EnvConfig::new(Some(&env_path));
        assert_eq!(source.get("EXTENSION_HOST_TEST_FROM_FILE").await, Some("abc123".to_string()));
    }
}
