use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const CONFIG_ENV_VAR: &str = "HFAST_QUEUE_CONFIG";
pub const DISCOVERY_PATHS: [&str; 2] = ["./hfast-queue.toml", "/etc/hfast-queue/hfast-queue.toml"];

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

/// Worker protocol listener.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_workers: usize,
    pub dispatch_deadline_ms: u64,
    pub pong_extension_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 11300,
            max_workers: 100,
            dispatch_deadline_ms: 60_000,
            pong_extension_ms: 120_000,
        }
    }
}

/// HTTP ingestion endpoint.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    pub host: String,
    pub port: u16,
    pub prefix: String,
    pub domain_header: String,
    pub secret_header: String,
    pub health_path: String,
    pub max_body_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            prefix: "queue".to_owned(),
            domain_header: "X-Domain".to_owned(),
            secret_header: "X-Secretkey".to_owned(),
            health_path: "/_queue/health".to_owned(),
            max_body_bytes: 8_388_608,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    pub topic_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            topic_capacity: crate::dispatch::DEFAULT_TOPIC_CAPACITY,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    /// Zero keeps sled's own default.
    pub cache_capacity: u64,
    pub flush_every_ms: u64,
    pub remove_on_ack: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/hfast-queue".to_owned(),
            cache_capacity: 0,
            flush_every_ms: 500,
            remove_on_ack: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Zero disables periodic statistics reporting.
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

impl AppConfig {
    /// Resolves the config file (`--config <path>`, then `$HFAST_QUEUE_CONFIG`,
    /// then [`DISCOVERY_PATHS`]) and applies the remaining `--section.key value`
    /// arguments on top. Without any file the built-in defaults are used.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();
        let explicit = take_config_path_arg(&mut args)?;

        match explicit.or_else(discover_config_path) {
            Some(path) => Self::load_from_toml_with_args(path, args),
            None => Self::default().with_overrides(args),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let display_path = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: display_path.clone(),
            source,
        })?;

        let config: AppConfig =
            toml::from_str(&toml_content).map_err(|source| ConfigError::TomlParse {
                path: display_path,
                source,
            })?;

        config.with_overrides(args)
    }

    fn with_overrides(self, args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut root_value = Value::try_from(&self).map_err(ConfigError::Serialize)?;

        for (key_path, raw_value) in parse_cli_overrides(args)? {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: AppConfig = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.ingest.prefix;
        if prefix.is_empty() || prefix.contains('/') {
            return Err(ConfigError::InvalidValue {
                key: "ingest.prefix",
                reason: "must be a single non-empty path segment",
            });
        }
        if !self.ingest.health_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "ingest.health_path",
                reason: "must start with '/'",
            });
        }
        if self.ingest.health_path.trim_matches('/') == prefix.as_str() {
            return Err(ConfigError::InvalidValue {
                key: "ingest.health_path",
                reason: "must not collide with the ingestion prefix",
            });
        }
        if self.ingest.domain_header.is_empty() || self.ingest.secret_header.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ingest.domain_header",
                reason: "tenant header names must not be empty",
            });
        }
        if self.dispatch.topic_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "dispatch.topic_capacity",
                reason: "must be greater than zero",
            });
        }
        if self.server.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.max_workers",
                reason: "must be greater than zero",
            });
        }
        if self.server.dispatch_deadline_ms == 0 || self.server.pong_extension_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.dispatch_deadline_ms",
                reason: "worker deadlines must be greater than zero",
            });
        }
        Ok(())
    }
}

fn take_config_path_arg(args: &mut Vec<String>) -> Result<Option<PathBuf>, ConfigError> {
    if args.first().map(String::as_str) != Some("--config") {
        return Ok(None);
    }

    if args.len() < 2 {
        return Err(ConfigError::MissingValueForArg {
            key: "config".to_owned(),
        });
    }

    let path = args.remove(1);
    args.remove(0);
    Ok(Some(PathBuf::from(path)))
}

fn discover_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(path));
    }

    DISCOVERY_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.is_file())
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Serialize(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidValue {
        key: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Serialize(source) => write!(f, "failed to render config for overrides: {source}"),
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidValue { key, reason } => write!(f, "invalid config value '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(key) = arg.strip_prefix("--").filter(|key| !key.is_empty()) else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };
        let key = key.to_owned();

        let value = iter
            .next()
            .ok_or_else(|| ConfigError::MissingValueForArg { key: key.clone() })?;
        parsed.push((key, value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for part in &parts {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*part)
            .ok_or_else(unknown)?;
    }

    *current = parse_value_using_current_type(key_path, raw_value, current)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
