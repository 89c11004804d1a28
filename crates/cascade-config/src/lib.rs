#![warn(missing_docs)]

//! # cascade-config
//!
//! Configuration loading for the cascade runner.
//!
//! Supports TOML configuration files with `${ENV_VAR}` expansion, a small set
//! of environment overrides, and defaults for every value.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! service_name = "cascade-runner"
//!
//! [log]
//! level = "info"
//!
//! [sandbox]
//! timeout_ms = 3000
//! max_heap_mb = 64
//! max_concurrent = 16
//! max_fetch_calls = 50
//! execution_mode = "in_process"
//!
//! [forward]
//! timeout_secs = 30
//!
//! [engine]
//! max_repeat = 1000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CASCADE_CONFIG";

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "cascade.toml";

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level runner configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CascadeConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Logging settings.
    #[serde(default)]
    pub log: LogSection,

    /// Script sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxSection,

    /// Outbound forwarding settings.
    #[serde(default)]
    pub forward: ForwardSection,

    /// Batch processing settings.
    #[serde(default)]
    pub engine: EngineSection,
}

/// `[server]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Name shown in every log line.
    pub service_name: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            service_name: "cascade-runner".into(),
        }
    }
}

/// `[log]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    /// Minimum level emitted.
    pub level: LogLevel,
}

/// `[sandbox]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxSection {
    /// Wall-clock budget per script, in milliseconds.
    pub timeout_ms: u64,
    /// V8 heap ceiling in megabytes.
    pub max_heap_mb: usize,
    /// Scripts allowed to run at once.
    pub max_concurrent: usize,
    /// `fetch` calls allowed per script.
    pub max_fetch_calls: usize,
    /// Maximum script source size in KiB.
    pub max_code_kb: usize,
    /// Maximum serialized result size in KiB.
    pub max_output_kb: usize,
    /// Where scripts run.
    pub execution_mode: ExecutionModeSetting,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            max_heap_mb: 64,
            max_concurrent: 16,
            max_fetch_calls: 50,
            max_code_kb: 64,
            max_output_kb: 1024,
            execution_mode: ExecutionModeSetting::default(),
        }
    }
}

/// Sandbox placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModeSetting {
    /// V8 isolate on a dedicated thread of the server process.
    #[default]
    InProcess,
    /// V8 isolate in a `cascade-worker` child process.
    ChildProcess,
}

/// `[forward]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwardSection {
    /// Per-request timeout for outbound HTTP, in seconds.
    pub timeout_secs: u64,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// `[engine]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    /// Upper bound for an action's `repeat`.
    pub max_repeat: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self { max_repeat: 1000 }
    }
}

/// Minimum log level. `None` disables logging entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LogLevel {
    /// Everything.
    Debug,
    /// Informational and above.
    #[default]
    Info,
    /// Warnings and errors.
    Warn,
    /// Errors only.
    Error,
    /// Nothing.
    None,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::None => "off",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "none" | "off" => Ok(LogLevel::None),
            other => Err(ConfigError::Invalid(format!(
                "unknown log level '{other}', supported: debug, info, warn, error, none"
            ))),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        value.parse()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::None => "NONE",
        };
        f.write_str(name)
    }
}

impl CascadeConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: CascadeConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    /// Resolve, load, and override the runtime configuration.
    ///
    /// The file is `explicit`, else `$CASCADE_CONFIG`, else `./cascade.toml`
    /// when it exists; with none of these the defaults are used. Environment
    /// overrides are applied afterwards and the result is re-validated.
    /// Returns the path that was loaded, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = find_config_file(explicit);
        let mut config = match &path {
            Some(p) => Self::from_file_with_env(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok((config, path))
    }

    /// Apply `PORT`, `SERVICE_NAME`, and `CASCADE_LOG_LEVEL` from `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT '{port}' is not a valid port")))?;
        }
        if let Some(name) = lookup("SERVICE_NAME").filter(|n| !n.trim().is_empty()) {
            self.server.service_name = name;
        }
        if let Some(level) = lookup("CASCADE_LOG_LEVEL") {
            self.log.level = level.parse()?;
        }
        self.validate()
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_ms must be greater than zero".into(),
            ));
        }
        if self.sandbox.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.max_concurrent must be greater than zero".into(),
            ));
        }
        if self.sandbox.max_heap_mb == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.max_heap_mb must be greater than zero".into(),
            ));
        }
        if self.forward.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "forward.timeout_secs must be greater than zero".into(),
            ));
        }
        if self.engine.max_repeat == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_repeat must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Pick the config file: explicit path, then `$CASCADE_CONFIG`, then
/// `./cascade.toml` if present.
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.exists().then_some(local)
}

/// Expand `${ENV_VAR}` patterns using the process environment.
/// Unset variables are left in place.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
