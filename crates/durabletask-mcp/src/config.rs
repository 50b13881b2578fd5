//! Server configuration.
//!
//! Loaded from a TOML file (every key optional), then overridden by
//! `DURABLETASK_MCP_*` environment variables.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use durabletask_gateway::credential::AuthMechanism;
use durabletask_gateway::engine::HttpEngineOptions;
use durabletask_gateway::enumerator::DEFAULT_PAGE_SIZE;
use durabletask_gateway::inventory::arm::{ArmOptions, DEFAULT_API_VERSION, DEFAULT_MANAGEMENT_URL};
use durabletask_gateway::GatewayOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_CONFIG_PATH: &str = "DURABLETASK_MCP_CONFIG";
pub const ENV_LOG_LEVEL: &str = "DURABLETASK_MCP_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "DURABLETASK_MCP_LOG_FORMAT";
pub const ENV_AUTHENTICATION: &str = "DURABLETASK_MCP_AUTHENTICATION";
pub const ENV_TOOL_TIMEOUT_SECS: &str = "DURABLETASK_MCP_TOOL_TIMEOUT_SECS";
pub const ENV_PAGE_SIZE: &str = "DURABLETASK_MCP_PAGE_SIZE";
pub const ENV_MAX_CONCURRENCY: &str = "DURABLETASK_MCP_MAX_CONCURRENCY";
pub const ENV_MANAGEMENT_URL: &str = "DURABLETASK_MCP_MANAGEMENT_URL";

/// Largest page requested from the engine in one query.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub engine: EngineSection,
    pub management: ManagementSection,
    pub bulk: BulkSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub name: String,
    /// Upper bound for one tool call; `0` disables the limit.
    pub tool_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub authentication: AuthMechanism,
    pub request_timeout_secs: u64,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementSection {
    pub base_url: String,
    pub api_version: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkSection {
    /// Concurrent engine calls per bulk operation; unset means unbounded.
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: "durabletask-mcp".to_string(),
            tool_timeout_secs: 300,
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            authentication: AuthMechanism::default(),
            request_timeout_secs: 30,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Default for ManagementSection {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MANAGEMENT_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` and apply process environment overrides.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `DURABLETASK_MCP_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = format
                .parse()
                .map_err(|e: String| ConfigError::invalid(ENV_LOG_FORMAT, e))?;
        }
        if let Some(auth) = lookup(ENV_AUTHENTICATION) {
            self.engine.authentication = auth
                .parse()
                .map_err(|e: String| ConfigError::invalid(ENV_AUTHENTICATION, e))?;
        }
        if let Some(secs) = lookup(ENV_TOOL_TIMEOUT_SECS) {
            self.server.tool_timeout_secs = parse_number(ENV_TOOL_TIMEOUT_SECS, &secs)?;
        }
        if let Some(size) = lookup(ENV_PAGE_SIZE) {
            self.engine.page_size = parse_number(ENV_PAGE_SIZE, &size)?;
        }
        if let Some(limit) = lookup(ENV_MAX_CONCURRENCY) {
            self.bulk.max_concurrency = Some(parse_number(ENV_MAX_CONCURRENCY, &limit)?);
        }
        if let Some(url) = lookup(ENV_MANAGEMENT_URL) {
            self.management.base_url = url;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.engine.page_size) {
            return Err(ConfigError::invalid(
                "engine.page_size",
                format!("must be between 1 and {MAX_PAGE_SIZE}"),
            ));
        }
        if self.bulk.max_concurrency == Some(0) {
            return Err(ConfigError::invalid("bulk.max_concurrency", "must be at least 1"));
        }
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::invalid("server.name", "must not be empty"));
        }
        Ok(())
    }

    /// `None` when tool calls are not time limited.
    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.server.tool_timeout_secs > 0).then(|| Duration::from_secs(self.server.tool_timeout_secs))
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            page_size: self.engine.page_size,
            max_concurrency: self.bulk.max_concurrency.and_then(NonZeroUsize::new),
        }
    }

    pub fn engine_options(&self) -> HttpEngineOptions {
        HttpEngineOptions {
            request_timeout: Duration::from_secs(self.engine.request_timeout_secs),
            ..Default::default()
        }
    }

    pub fn arm_options(&self) -> ArmOptions {
        ArmOptions {
            base_url: self.management.base_url.clone(),
            api_version: self.management.api_version.clone(),
            request_timeout: Duration::from_secs(self.management.request_timeout_secs),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, format!("'{raw}' is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.engine.authentication, AuthMechanism::DefaultAzure);
        assert_eq!(config.engine.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.tool_timeout(), Some(Duration::from_secs(300)));
        assert!(config.gateway_options().max_concurrency.is_none());
        assert_eq!(config.arm_options().api_version, DEFAULT_API_VERSION);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[engine]
authentication = "none"
page_size = 25

[bulk]
max_concurrency = 4

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.engine.authentication, AuthMechanism::None);
        assert_eq!(config.engine.page_size, 25);
        assert_eq!(config.engine.request_timeout_secs, 30);
        assert_eq!(config.gateway_options().max_concurrency, NonZeroUsize::new(4));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.server.name, "durabletask-mcp");
    }

    #[test]
    fn test_load_rejects_bad_files() {
        let missing = ServerConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\npage_size = 0").unwrap();
        let invalid = ServerConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(invalid, ConfigError::Invalid { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine\n").unwrap();
        let parse = ServerConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(parse, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_page_size_is_bounded() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env_overrides(env(&[(ENV_PAGE_SIZE, usize::MAX.to_string().as_str())]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        config.engine.page_size = MAX_PAGE_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env_overrides(env(&[
                (ENV_AUTHENTICATION, "AzureCli"),
                (ENV_TOOL_TIMEOUT_SECS, "0"),
                (ENV_MAX_CONCURRENCY, "8"),
                (ENV_LOG_LEVEL, "debug"),
            ]))
            .unwrap();

        assert_eq!(config.engine.authentication, AuthMechanism::AzureCli);
        assert_eq!(config.tool_timeout(), None);
        assert_eq!(config.bulk.max_concurrency, Some(8));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_env_overrides_reject_garbage() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env_overrides(env(&[(ENV_PAGE_SIZE, "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_PAGE_SIZE));

        let err = config
            .apply_env_overrides(env(&[(ENV_AUTHENTICATION, "kerberos")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
