use std::{path::Path, time::Duration};

use eyre::Result;
use serde::{Deserialize, Serialize};

/// Main configuration for the tracegate trace adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TracegateConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    pub readiness: ReadinessConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-request budget for proxied calls, in milliseconds.
    pub request_timeout_ms: u64,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Full connection URL. When set, the individual connection fields are ignored.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub pool_size: u32,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub ssl: bool,
    pub ssl_reject_unauthorized: bool,
    /// Hard limit for the primary trace query, in milliseconds.
    pub query_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: String,
    pub timeout_ms: u64,
}

/// How an empty trace result is checked against indexer lag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Zero rows is always final.
    None,
    /// Compare the block against a ready height (explicit or head minus lag).
    Height,
    /// Compare indexed transaction counts against traced transaction counts.
    #[serde(alias = "per_block")]
    Counts,
}

impl ReadinessMode {
    /// Parse a mode selector, returning `None` for unrecognised values.
    pub fn from_selector(selector: &str) -> Option<Self> {
        match selector.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "height" => Some(Self::Height),
            "counts" | "per_block" => Some(Self::Counts),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Height => "height",
            Self::Counts => "counts",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub mode: Option<ReadinessMode>,
    /// Explicit highest block considered fully traced.
    pub ready_height: Option<u64>,
    /// Distance from the upstream head that is considered fully traced.
    pub lag: Option<u64>,
    /// Log every not-ready decision at info level.
    pub debug: bool,
}

impl ReadinessConfig {
    /// The mode in effect: an explicit selector wins, otherwise a configured
    /// height guard implies `Height`.
    pub fn effective_mode(&self) -> ReadinessMode {
        match self.mode {
            Some(mode) => mode,
            None if self.ready_height.is_some() || self.lag.is_some() => ReadinessMode::Height,
            None => ReadinessMode::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8545,
            request_timeout_ms: 15_000,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            name: "blockscout".to_string(),
            user: None,
            password: None,
            pool_size: 10,
            idle_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            ssl: false,
            ssl_reject_unauthorized: true,
            query_timeout_ms: 15_000,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8545".to_string(),
            timeout_ms: 15_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "human".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl TracegateConfig {
    /// Load configuration from a TOML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: TracegateConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.upstream.url.is_empty() {
            eyre::bail!("Upstream RPC URL cannot be empty");
        }

        if self.database.pool_size == 0 {
            eyre::bail!("Database pool size cannot be zero");
        }

        if self.database.query_timeout_ms == 0 || self.upstream.timeout_ms == 0 {
            eyre::bail!("Query and upstream timeouts cannot be zero");
        }

        if self.server.request_timeout_ms == 0 {
            eyre::bail!("Request timeout cannot be zero");
        }

        Ok(())
    }

    /// Socket address string the HTTP server binds to
    pub fn listen_addr(&self) -> String {
        self.server.listen_addr()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TracegateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr(), "0.0.0.0:8545");
        assert_eq!(config.readiness.effective_mode(), ReadinessMode::None);
    }

    #[test]
    fn test_validation_rejects_empty_upstream() {
        let mut config = TracegateConfig::default();
        config.upstream.url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_height_guard_implies_height_mode() {
        let readiness = ReadinessConfig {
            lag: Some(5),
            ..Default::default()
        };
        assert_eq!(readiness.effective_mode(), ReadinessMode::Height);

        let explicit = ReadinessConfig {
            mode: Some(ReadinessMode::Counts),
            ready_height: Some(10),
            ..Default::default()
        };
        assert_eq!(explicit.effective_mode(), ReadinessMode::Counts);
    }

    #[test]
    fn test_mode_selector_parsing() {
        assert_eq!(ReadinessMode::from_selector("COUNTS"), Some(ReadinessMode::Counts));
        assert_eq!(ReadinessMode::from_selector("per_block"), Some(ReadinessMode::Counts));
        assert_eq!(ReadinessMode::from_selector("height"), Some(ReadinessMode::Height));
        assert_eq!(ReadinessMode::from_selector("bogus"), None);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tracegate.toml");

        let mut config = TracegateConfig::default();
        config.readiness.mode = Some(ReadinessMode::Counts);
        config.database.query_timeout_ms = 2_500;
        config.save_to_file(&path).await.unwrap();

        let loaded = TracegateConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.readiness.mode, Some(ReadinessMode::Counts));
        assert_eq!(loaded.database.query_timeout_ms, 2_500);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TracegateConfig = toml::from_str(
            r#"
            [readiness]
            mode = "per_block"

            [upstream]
            url = "http://node:8545"
            "#,
        )
        .unwrap();
        assert_eq!(config.readiness.mode, Some(ReadinessMode::Counts));
        assert_eq!(config.upstream.url, "http://node:8545");
        assert_eq!(config.upstream.timeout_ms, 15_000);
        assert_eq!(config.database.name, "blockscout");
    }
}
