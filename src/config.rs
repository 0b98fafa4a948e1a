//! Library configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/switchboard/switchboard.toml`.
//!
//! # Sections
//! - `schema_version = 1` (required)
//! - `[inbound]` — host, port, password (inline or via `password_file`),
//!   connect timeout
//! - `[outbound]` — bind address, linger/myevents/event subscription
//!
//! # Password file format
//! Raw password on a single line; trimmed on read.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level library configuration.
#[derive(Debug, Clone)]
pub struct EslConfig {
    pub schema_version: u32,
    pub inbound: InboundConfig,
    pub outbound: OutboundServerConfig,
}

/// Settings for dialing FreeSWITCH (inbound mode).
#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub host: String,
    pub port: u16,
    /// The password itself (read from `password_file` when configured).
    pub password: String,
    pub connect_timeout_ms: u64,
}

impl Default for InboundConfig {
    fn default() -> Self {
        InboundConfig {
            host: "127.0.0.1".to_owned(),
            port: 8021,
            password: "ClueCon".to_owned(),
            connect_timeout_ms: 5000,
        }
    }
}

/// Settings for the outbound socket server.
#[derive(Debug, Clone)]
pub struct OutboundServerConfig {
    pub bind: String,
    pub linger: bool,
    pub myevents: bool,
    pub events: bool,
}

impl Default for OutboundServerConfig {
    fn default() -> Self {
        OutboundServerConfig {
            bind: "127.0.0.1:8084".to_owned(),
            linger: true,
            myevents: false,
            events: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    inbound: Option<RawInboundConfig>,
    outbound: Option<RawOutboundConfig>,
}

#[derive(Debug, Deserialize)]
struct RawInboundConfig {
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    password_file: Option<String>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawOutboundConfig {
    bind: Option<String>,
    linger: Option<bool>,
    myevents: Option<bool>,
    events: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default path `/etc/switchboard/switchboard.toml`.
pub fn load_config() -> Result<EslConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/switchboard/switchboard.toml"))
}

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<EslConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string (used directly by tests).
pub fn load_config_from_str(toml_str: &str) -> Result<EslConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let defaults = InboundConfig::default();
    let inbound = match raw.inbound {
        Some(i) => {
            let password = match (&i.password_file, i.password) {
                (Some(file), _) => read_password_file(file)?,
                (None, Some(password)) => password,
                (None, None) => defaults.password.clone(),
            };
            InboundConfig {
                host: i.host.unwrap_or(defaults.host),
                port: i.port.unwrap_or(defaults.port),
                password,
                connect_timeout_ms: i.connect_timeout_ms.unwrap_or(defaults.connect_timeout_ms),
            }
        }
        None => defaults,
    };

    let out_defaults = OutboundServerConfig::default();
    let outbound = match raw.outbound {
        Some(o) => OutboundServerConfig {
            bind: o.bind.unwrap_or(out_defaults.bind),
            linger: o.linger.unwrap_or(out_defaults.linger),
            myevents: o.myevents.unwrap_or(out_defaults.myevents),
            events: o.events.unwrap_or(out_defaults.events),
        },
        None => out_defaults,
    };

    Ok(EslConfig {
        schema_version,
        inbound,
        outbound,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Password file reader
// ---------------------------------------------------------------------------

fn read_password_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading password file '{path}': {e}")))?;
    Ok(content.trim().to_owned())
}
