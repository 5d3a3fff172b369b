// Configuration loading and parsing (stockdraft.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Upper bound on `cache.staleness_hours` (one year).
pub const MAX_STALENESS_HOURS: u64 = 24 * 365;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub draft: DraftConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the draft server, e.g. `ws://localhost:8080`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path suffix of the websocket endpoint.
    #[serde(default = "default_ws_path")]
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            base_url: default_base_url(),
            path: default_ws_path(),
        }
    }
}

impl ServerConfig {
    /// The full websocket URL (base URL joined with the endpoint path).
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// A connect attempt that has not completed within this window is
    /// abandoned and counts as a failure.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// SQLite file backing the durable cache. When omitted the platform data
    /// directory is used.
    #[serde(default)]
    pub db_path: Option<String>,
    /// Cached pick history older than this is discarded.
    #[serde(default = "default_staleness_hours")]
    pub staleness_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            db_path: None,
            staleness_hours: default_staleness_hours(),
        }
    }
}

impl CacheConfig {
    /// Clamped to [`MAX_STALENESS_HOURS`] so an unvalidated value cannot
    /// overflow the duration.
    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::hours(self.staleness_hours.min(MAX_STALENESS_HOURS) as i64)
    }

    /// Resolve the database path, falling back to
    /// `<data dir>/stockdraft/cache.db`.
    pub fn resolved_db_path(&self) -> String {
        if let Some(path) = &self.db_path {
            return path.clone();
        }
        directories::ProjectDirs::from("", "", "stockdraft")
            .map(|dirs| dirs.data_dir().join("cache.db").to_string_lossy().into_owned())
            .unwrap_or_else(|| "stockdraft-cache.db".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftConfig {
    /// Delay before the last turn update is re-emitted after a reconnect.
    #[serde(default = "default_rebroadcast_delay_ms")]
    pub rebroadcast_delay_ms: u64,
}

impl Default for DraftConfig {
    fn default() -> Self {
        DraftConfig {
            rebroadcast_delay_ms: default_rebroadcast_delay_ms(),
        }
    }
}

impl DraftConfig {
    pub fn rebroadcast_delay(&self) -> Duration {
        Duration::from_millis(self.rebroadcast_delay_ms)
    }
}

fn default_base_url() -> String {
    "ws://localhost:8080".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_staleness_hours() -> u64 {
    24
}

fn default_rebroadcast_delay_ms() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&text).map_err(|e| match e {
        ConfigError::ParseError { source, .. } => ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })?;
    Ok(config)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(text).map_err(|source| ConfigError::ParseError {
        path: PathBuf::from("<inline>"),
        source,
    })?;
    validate(&config)?;
    Ok(config)
}

/// Validate semantic constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let url = config.server.base_url.trim();
    if url.is_empty() {
        return Err(validation("server.base_url", "must not be empty"));
    }
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(validation(
            "server.base_url",
            &format!("must use ws:// or wss://, got {url}"),
        ));
    }
    let path = config.server.path.trim();
    if path.is_empty() {
        return Err(validation("server.path", "must not be empty"));
    }
    if path.contains("://") {
        return Err(validation(
            "server.path",
            &format!("must be a path, not a URL, got {path}"),
        ));
    }
    if config.reconnect.base_delay_ms == 0 {
        return Err(validation("reconnect.base_delay_ms", "must be greater than 0"));
    }
    if config.reconnect.max_delay_ms < config.reconnect.base_delay_ms {
        return Err(validation(
            "reconnect.max_delay_ms",
            "must be at least reconnect.base_delay_ms",
        ));
    }
    if config.reconnect.connect_timeout_ms == 0 {
        return Err(validation("reconnect.connect_timeout_ms", "must be greater than 0"));
    }
    if config.cache.staleness_hours == 0 {
        return Err(validation("cache.staleness_hours", "must be greater than 0"));
    }
    if config.cache.staleness_hours > MAX_STALENESS_HOURS {
        return Err(validation(
            "cache.staleness_hours",
            &format!("must be at most {MAX_STALENESS_HOURS}"),
        ));
    }
    Ok(())
}

fn validation(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.endpoint(), "ws://localhost:8080/ws");
        assert_eq!(config.reconnect.base_delay(), Duration::from_secs(1));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(30));
        assert_eq!(config.reconnect.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache.staleness_hours, 24);
        assert_eq!(config.draft.rebroadcast_delay(), Duration::from_millis(500));
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse_config(
            r#"
            [server]
            base_url = "wss://draft.example.com/"
            path = "socket"

            [reconnect]
            base_delay_ms = 250
            max_delay_ms = 4000

            [cache]
            db_path = "/tmp/draft.db"
            staleness_hours = 12
            "#,
        )
        .unwrap();
        assert_eq!(config.server.endpoint(), "wss://draft.example.com/socket");
        assert_eq!(config.reconnect.base_delay_ms, 250);
        assert_eq!(config.cache.resolved_db_path(), "/tmp/draft.db");
        assert_eq!(config.cache.staleness(), chrono::Duration::hours(12));
    }

    #[test]
    fn rejects_http_url() {
        let err = parse_config("[server]\nbase_url = \"http://localhost\"").unwrap_err();
        match err {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "server.base_url"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_max_delay_below_base() {
        let err =
            parse_config("[reconnect]\nbase_delay_ms = 5000\nmax_delay_ms = 100").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn rejects_zero_staleness() {
        let err = parse_config("[cache]\nstaleness_hours = 0").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    fn rejected_field(input: &str) -> String {
        match parse_config(input).unwrap_err() {
            ConfigError::ValidationError { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_oversized_staleness() {
        assert_eq!(
            rejected_field("[cache]\nstaleness_hours = 3000000000000000"),
            "cache.staleness_hours"
        );
        assert_eq!(
            rejected_field(&format!("[cache]\nstaleness_hours = {}", MAX_STALENESS_HOURS + 1)),
            "cache.staleness_hours"
        );
        let config = parse_config(&format!("[cache]\nstaleness_hours = {MAX_STALENESS_HOURS}"))
            .unwrap();
        assert_eq!(config.cache.staleness(), chrono::Duration::days(365));
    }

    #[test]
    fn staleness_is_clamped_without_validation() {
        let cache = CacheConfig {
            db_path: None,
            staleness_hours: u64::MAX,
        };
        assert_eq!(cache.staleness(), chrono::Duration::hours(MAX_STALENESS_HOURS as i64));
    }

    #[test]
    fn rejects_empty_or_url_path() {
        assert_eq!(rejected_field("[server]\npath = \"\""), "server.path");
        assert_eq!(rejected_field("[server]\npath = \"   \""), "server.path");
        assert_eq!(
            rejected_field("[server]\npath = \"ws://other.example.com/ws\""),
            "server.path"
        );
    }

    #[test]
    fn rejects_zero_connect_timeout() {
        assert_eq!(
            rejected_field("[reconnect]\nconnect_timeout_ms = 0"),
            "reconnect.connect_timeout_ms"
        );
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = parse_config("[server\nbase_url = 1").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_config(Path::new("/definitely/not/here/stockdraft.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn shipped_defaults_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../defaults/stockdraft.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.path, "/ws");
    }
}
