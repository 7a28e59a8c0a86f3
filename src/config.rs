//! # Configuration Management
//!
//! Centralized configuration for the debugging transport and router.
//!
//! This module provides structured configuration for framing limits, bulk copy
//! buffers, router classification tables, and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Framing Limits
//! - The JSON length field is scanned for at most 20 bytes before the
//!   transport gives up on the packet
//! - Declared JSON payloads above 16 MB are rejected before allocation

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::Level;

/// Number of bytes peeked to select the incoming packet kind
pub const PACKET_TYPE_PEEK: usize = 4;

/// Longest JSON length field accepted before the delimiter must appear
pub const MAX_DELIMITER_SCAN: usize = 20;

/// Longest actor or type token accepted in a bulk header
pub const MAX_TOKEN_SCAN: usize = 1024;

/// Max allowed JSON payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Copy buffer used when streaming bulk payloads
pub const BULK_COPY_BUFFER_SIZE: usize = 0x8000;

/// Capacity of the in-memory pipe used for same-process bulk sends
pub const LOCAL_PIPE_CAPACITY: usize = 64 * 1024;

/// Default depth limit for recursive actor scans
pub const DEFAULT_MAX_SCAN_DEPTH: usize = 32;

/// Name of the synthetic root actor every connection starts from
pub const ROOT_ACTOR: &str = "root";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DevtoolsConfig {
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Router configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DevtoolsConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(limit) = std::env::var("DEVTOOLS_TRANSPORT_MAX_DELIMITER_SCAN") {
            if let Ok(val) = limit.parse::<usize>() {
                config.transport.max_delimiter_scan = val;
            }
        }

        if let Ok(size) = std::env::var("DEVTOOLS_TRANSPORT_MAX_PAYLOAD_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.transport.max_payload_size = val;
            }
        }

        if let Ok(size) = std::env::var("DEVTOOLS_TRANSPORT_BULK_BUFFER_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.transport.bulk_copy_buffer_size = val;
            }
        }

        if let Ok(depth) = std::env::var("DEVTOOLS_TRANSPORT_MAX_SCAN_DEPTH") {
            if let Ok(val) = depth.parse::<usize>() {
                config.router.max_scan_depth = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.transport.validate());
        errors.extend(self.router.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum bytes scanned for the `:` ending a JSON length field
    pub max_delimiter_scan: usize,

    /// Maximum declared JSON payload size in bytes
    pub max_payload_size: usize,

    /// Buffer size for bulk stream copies
    pub bulk_copy_buffer_size: usize,

    /// Initial capacity of the incoming read buffer
    pub read_buffer_capacity: usize,

    /// Capacity of the in-memory pipe behind same-process bulk sends
    pub local_pipe_capacity: usize,

    /// Maximum bytes scanned for the actor and type tokens of a bulk header
    pub max_token_scan: usize,

    /// Log every packet body at debug level
    pub log_packets: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_delimiter_scan: MAX_DELIMITER_SCAN,
            max_payload_size: MAX_PAYLOAD_SIZE,
            bulk_copy_buffer_size: BULK_COPY_BUFFER_SIZE,
            read_buffer_capacity: 8 * 1024,
            local_pipe_capacity: LOCAL_PIPE_CAPACITY,
            max_token_scan: MAX_TOKEN_SCAN,
            log_packets: false,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        // The length field of a 16 MB payload is 8 digits; anything under 2 can't frame "0:"
        if self.max_delimiter_scan < 2 {
            errors.push("Delimiter scan limit too small (minimum: 2)".to_string());
        } else if self.max_delimiter_scan > 64 {
            errors.push(format!(
                "Delimiter scan limit too large: {} (maximum: 64)",
                self.max_delimiter_scan
            ));
        }

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size > 256 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 256 MB)",
                self.max_payload_size
            ));
        }

        if self.bulk_copy_buffer_size == 0 {
            errors.push("Bulk copy buffer size cannot be 0".to_string());
        }

        if self.read_buffer_capacity < 16 {
            errors.push("Read buffer capacity too small (minimum: 16 bytes)".to_string());
        }

        if self.max_token_scan == 0 {
            errors.push("Bulk token scan limit cannot be 0".to_string());
        }

        if self.local_pipe_capacity == 0 {
            errors.push("Local pipe capacity cannot be 0".to_string());
        }

        errors
    }
}

/// Router configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Maximum nesting depth scanned for actor references
    pub max_scan_depth: usize,

    /// Packet types that are unsolicited events rather than replies
    pub unsolicited_types: BTreeSet<String>,

    /// Request types that never receive a reply
    pub oneway_types: BTreeSet<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let unsolicited = [
            "tabNavigated",
            "tabListChanged",
            "tabDetached",
            "addonListChanged",
            "workerListChanged",
            "newSource",
            "newGlobal",
            "consoleAPICall",
            "pageError",
            "logMessage",
            "networkEvent",
            "networkEventUpdate",
            "newMutations",
            "frameUpdate",
            "overheard",
            "appOpen",
            "appClose",
        ];
        let oneway = ["listen", "unlisten", "dispatch"];
        Self {
            max_scan_depth: DEFAULT_MAX_SCAN_DEPTH,
            unsolicited_types: unsolicited.iter().map(|s| s.to_string()).collect(),
            oneway_types: oneway.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RouterConfig {
    /// Validate router configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_scan_depth == 0 {
            errors.push("Max scan depth must be greater than 0".to_string());
        } else if self.max_scan_depth > 1024 {
            errors.push(format!(
                "Max scan depth too large: {} (maximum: 1024)",
                self.max_scan_depth
            ));
        }

        if let Some(both) = self
            .unsolicited_types
            .intersection(&self.oneway_types)
            .next()
        {
            errors.push(format!(
                "Type '{both}' cannot be both an unsolicited event and a one-way request"
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("devtools-transport"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
