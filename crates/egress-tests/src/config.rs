//! Suite configuration.
//!
//! Configuration is loaded from environment variables, or from a JSON file
//! named by `CONFIG` whose keys are the lowercase variable names
//! (`cf_api`, `secure_address`, ...). Passwords are held as
//! [`SecretString`] so they are redacted in Debug output.
//!
//! | Variable | Required | Default |
//! |---|---|---|
//! | `CF_API` | yes | |
//! | `CF_APPS_DOMAIN` | yes | |
//! | `CF_ADMIN_USER` / `CF_ADMIN_PASSWORD` | yes | |
//! | `CF_USER` / `CF_USER_PASSWORD` | yes | |
//! | `CF_ORG` / `CF_SPACE` | yes | |
//! | `SECURE_ADDRESS` | yes | |
//! | `CF_SKIP_SSL_VALIDATION` | no | `false` |
//! | `CF_BINARY` | no | `cf` |
//! | `NORA_PATH` | no | `assets/nora/NoraPublished` |
//! | `NORA_STACK` | no | `windows2012R2` |
//! | `NORA_BUILDPACK` | no | `binary_buildpack` |
//! | `NORA_MEMORY` | no | `256M` |
//! | `CF_PUSH_TIMEOUT_SECONDS` | no | 240 |
//! | `DEFAULT_TIMEOUT_SECONDS` | no | 30 |
//! | `CF_COMMAND_TIMEOUT_SECONDS` | no | 60 |

use crate::cli::UserContext;
use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an optional JSON config file.
pub const CONFIG_FILE_VAR: &str = "CONFIG";

/// Default `cf` executable, resolved through PATH.
pub const DEFAULT_CF_BINARY: &str = "cf";

/// Default location of the published nora app.
pub const DEFAULT_NORA_PATH: &str = "assets/nora/NoraPublished";

/// Default stack nora is pushed to.
pub const DEFAULT_NORA_STACK: &str = "windows2012R2";

/// Default buildpack nora is pushed with.
pub const DEFAULT_NORA_BUILDPACK: &str = "binary_buildpack";

/// Default memory limit for nora.
pub const DEFAULT_NORA_MEMORY: &str = "256M";

/// Default timeout for push/start/restart in seconds.
pub const DEFAULT_PUSH_TIMEOUT_SECONDS: u64 = 240;

/// Default timeout for readiness and egress polling in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default timeout for any other single `cf` command in seconds.
pub const DEFAULT_CF_COMMAND_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid secure address: {0}")]
    InvalidSecureAddress(String),

    #[error("Invalid timeout configuration: {0}")]
    InvalidTimeout(String),

    #[error("Invalid boolean for {key}: '{value}'")]
    InvalidBool { key: String, value: String },

    #[error("Failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// An external `host:port` that the default running security groups block.
///
/// Parsing follows the usual host/port split: the port is after the last
/// colon, IPv6 hosts must be bracketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureAddress {
    pub host: String,
    pub port: u16,
}

impl SecureAddress {
    pub fn parse(address: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| {
            ConfigError::InvalidSecureAddress(format!("'{}': {}", address, reason))
        };

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| invalid("missing port after bracketed host"))?;
            (host, port)
        } else {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?;
            if host.contains(':') {
                return Err(invalid("too many colons; bracket IPv6 hosts"));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port: u16 = port
            .parse()
            .map_err(|e| invalid(&format!("port must be 1-65535: {}", e)))?;
        if port == 0 {
            return Err(invalid("port must be 1-65535"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for SecureAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Suite configuration.
///
/// Passwords are `SecretString`, so the derived Debug is safe to log.
#[derive(Debug, Clone)]
pub struct Config {
    /// Platform API endpoint, e.g. `api.bosh-lite.com`.
    pub api: String,

    /// Domain apps are routed under, e.g. `bosh-lite.com`.
    pub apps_domain: String,

    /// Skip TLS verification for the API and app routes.
    pub skip_ssl_validation: bool,

    pub admin_user: String,
    pub admin_password: SecretString,

    pub user: String,
    pub user_password: SecretString,

    /// Org and space the regular user pushes into and space-scoped
    /// security groups are bound to.
    pub org: String,
    pub space: String,

    /// External target for egress probes.
    pub secure_address: SecureAddress,

    /// `cf` executable.
    pub cf_binary: String,

    pub nora_path: String,
    pub nora_stack: String,
    pub nora_buildpack: String,
    pub nora_memory: String,

    /// Bound on push/start/restart.
    pub push_timeout: Duration,

    /// Bound on readiness and egress polling.
    pub default_timeout: Duration,

    /// Bound on every other `cf` command.
    pub cf_command_timeout: Duration,
}

impl Config {
    /// Load configuration from the `CONFIG` file if set, otherwise from
    /// environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var(CONFIG_FILE_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Self::from_env(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a JSON file.
    ///
    /// Keys are the lowercase variable names; string, number and boolean
    /// values are accepted.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: HashMap<String, serde_json::Value> =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_vars(&file_vars(raw))
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let required = |key: &str| -> Result<String, ConfigError> {
            vars.get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };
        let optional = |key: &str, default: &str| -> String {
            vars.get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let secure_address = SecureAddress::parse(&required("SECURE_ADDRESS")?)?;

        Ok(Self {
            api: required("CF_API")?,
            apps_domain: required("CF_APPS_DOMAIN")?,
            skip_ssl_validation: parse_bool(vars, "CF_SKIP_SSL_VALIDATION")?,
            admin_user: required("CF_ADMIN_USER")?,
            admin_password: SecretString::from(required("CF_ADMIN_PASSWORD")?),
            user: required("CF_USER")?,
            user_password: SecretString::from(required("CF_USER_PASSWORD")?),
            org: required("CF_ORG")?,
            space: required("CF_SPACE")?,
            secure_address,
            cf_binary: optional("CF_BINARY", DEFAULT_CF_BINARY),
            nora_path: optional("NORA_PATH", DEFAULT_NORA_PATH),
            nora_stack: optional("NORA_STACK", DEFAULT_NORA_STACK),
            nora_buildpack: optional("NORA_BUILDPACK", DEFAULT_NORA_BUILDPACK),
            nora_memory: optional("NORA_MEMORY", DEFAULT_NORA_MEMORY),
            push_timeout: parse_timeout(
                vars,
                "CF_PUSH_TIMEOUT_SECONDS",
                DEFAULT_PUSH_TIMEOUT_SECONDS,
            )?,
            default_timeout: parse_timeout(
                vars,
                "DEFAULT_TIMEOUT_SECONDS",
                DEFAULT_TIMEOUT_SECONDS,
            )?,
            cf_command_timeout: parse_timeout(
                vars,
                "CF_COMMAND_TIMEOUT_SECONDS",
                DEFAULT_CF_COMMAND_TIMEOUT_SECONDS,
            )?,
        })
    }

    /// Administrator context, without an org/space target.
    pub fn admin_context(&self) -> UserContext {
        UserContext {
            api: self.api.clone(),
            username: self.admin_user.clone(),
            password: self.admin_password.clone(),
            org: None,
            space: None,
            skip_ssl_validation: self.skip_ssl_validation,
        }
    }

    /// Regular user context, targeted at the test org/space.
    pub fn regular_context(&self) -> UserContext {
        UserContext {
            api: self.api.clone(),
            username: self.user.clone(),
            password: self.user_password.clone(),
            org: Some(self.org.clone()),
            space: Some(self.space.clone()),
            skip_ssl_validation: self.skip_ssl_validation,
        }
    }
}

fn parse_timeout(
    vars: &HashMap<String, String>,
    key: &str,
    default_seconds: u64,
) -> Result<Duration, ConfigError> {
    let Some(value_str) = vars.get(key).filter(|value| !value.is_empty()) else {
        return Ok(Duration::from_secs(default_seconds));
    };

    let value: u64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidTimeout(format!(
            "{} must be a valid positive integer, got '{}': {}",
            key, value_str, e
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidTimeout(format!(
            "{} must be greater than 0",
            key
        )));
    }

    Ok(Duration::from_secs(value))
}

fn parse_bool(vars: &HashMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    match vars.get(key).map(|value| value.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(value) => match value.as_str() {
            "" | "false" | "0" | "no" => Ok(false),
            "true" | "1" | "yes" => Ok(true),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.clone(),
            }),
        },
    }
}

/// Map JSON config keys onto the environment variable names.
fn file_vars(raw: HashMap<String, serde_json::Value>) -> HashMap<String, String> {
    raw.into_iter()
        .filter_map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some((key.to_ascii_uppercase(), value))
        })
        .collect()
}
