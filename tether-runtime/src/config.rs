//! Runtime Configuration
//!
//! Configuration for the Tether runtime. It can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `TETHER_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TETHER_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `TETHER_LOG_FORMAT` | Log output format (plain/json) | plain |
//! | `TETHER_ARENA_CHUNK_SIZE` | Arena chunk size in bytes | 65536 (64KB) |
//! | `TETHER_ARENA_MAX_SIZE` | Arena capacity in bytes (0 = unlimited) | 0 |
//! | `TETHER_LEAK_POLICY` | Arena teardown with live allocations (fatal/warn/ignore) | warn |
//! | `TETHER_CHECK_NOTHING_ACCESS` | Report value access through nothing instances | debug builds |
//! | `TETHER_ABORT_ON_FATAL` | Abort the process instead of panicking on fatal faults | false |
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_runtime::config::{LeakPolicy, RuntimeConfig};
//!
//! let config = RuntimeConfig::builder()
//!     .arena_chunk_size(16 * 1024)
//!     .leak_policy(LeakPolicy::Fatal)
//!     .build()?;
//! ```

use std::env;
use std::fmt;

use crate::log::{LogFormat, LogLevel};

/// Smallest chunk an arena may be configured with.
pub const MIN_ARENA_CHUNK_SIZE: usize = 256;

/// What an arena does when it is torn down while allocations it handed out
/// individually are still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeakPolicy {
    /// Raise a fatal fault.
    Fatal,
    /// Report the leak and continue.
    #[default]
    Warn,
    /// Say nothing.
    Ignore,
}

impl LeakPolicy {
    /// Parse a policy from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fatal" | "panic" | "abort" => Some(LeakPolicy::Fatal),
            "warn" | "warning" | "log" => Some(LeakPolicy::Warn),
            "ignore" | "off" | "none" => Some(LeakPolicy::Ignore),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeakPolicy::Fatal => "fatal",
            LeakPolicy::Warn => "warn",
            LeakPolicy::Ignore => "ignore",
        }
    }
}

/// Arena configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Size of each chunk requested from the system heap.
    /// Default: 64KB.
    pub chunk_size: usize,

    /// Total bytes an arena may reserve. 0 means unlimited (default).
    pub max_size: usize,

    /// Policy applied at teardown when individually owned allocations are
    /// still live.
    pub leak_policy: LeakPolicy,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_size: 0,
            leak_policy: LeakPolicy::Warn,
        }
    }
}

/// Diagnostics configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    /// Report value access through a nothing instance.
    /// Default: enabled in debug builds.
    pub check_nothing_access: bool,

    /// Abort the process on fatal faults instead of unwinding.
    /// Default: false.
    pub abort_on_fatal: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            check_nothing_access: cfg!(debug_assertions),
            abort_on_fatal: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Output format.
    /// Default: Plain.
    pub format: LogFormat,
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    /// Arena configuration used by `Arena::new`.
    pub arena: ArenaConfig,

    /// Fault reporting configuration.
    pub diagnostics: DiagnosticsConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their default values, and so do values that fail
    /// to parse or fall outside their valid range.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("TETHER_LOG_LEVEL") {
            if let Some(level) = LogLevel::from_str(&val) {
                config.log.level = level;
            }
        }

        if let Ok(val) = env::var("TETHER_LOG_FORMAT") {
            if let Some(format) = LogFormat::from_str(&val) {
                config.log.format = format;
            }
        }

        if let Some(val) = parse_env_usize("TETHER_ARENA_CHUNK_SIZE") {
            if val >= MIN_ARENA_CHUNK_SIZE && val.is_power_of_two() {
                config.arena.chunk_size = val;
            }
        }

        if let Some(val) = parse_env_usize("TETHER_ARENA_MAX_SIZE") {
            if val == 0 || val >= config.arena.chunk_size {
                config.arena.max_size = val;
            }
        }

        if let Ok(val) = env::var("TETHER_LEAK_POLICY") {
            if let Some(policy) = LeakPolicy::from_str(&val) {
                config.arena.leak_policy = policy;
            }
        }

        if let Some(val) = parse_env_bool("TETHER_CHECK_NOTHING_ACCESS") {
            config.diagnostics.check_nothing_access = val;
        }

        if let Some(val) = parse_env_bool("TETHER_ABORT_ON_FATAL") {
            config.diagnostics.abort_on_fatal = val;
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena.chunk_size < MIN_ARENA_CHUNK_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "arena.chunk_size".into(),
                message: format!("must be at least {} bytes", MIN_ARENA_CHUNK_SIZE),
            });
        }

        if !self.arena.chunk_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                field: "arena.chunk_size".into(),
                message: "must be a power of two".into(),
            });
        }

        if self.arena.max_size != 0 && self.arena.max_size < self.arena.chunk_size {
            return Err(ConfigError::InvalidValue {
                field: "arena.max_size".into(),
                message: "must be 0 (unlimited) or at least arena.chunk_size".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value.
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { field, message } => {
                write!(f, "invalid configuration for '{}': {}", field, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the arena chunk size in bytes.
    pub fn arena_chunk_size(mut self, size: usize) -> Self {
        self.config.arena.chunk_size = size;
        self
    }

    /// Set the arena capacity in bytes (0 = unlimited).
    pub fn arena_max_size(mut self, size: usize) -> Self {
        self.config.arena.max_size = size;
        self
    }

    /// Set the leak policy applied at arena teardown.
    pub fn leak_policy(mut self, policy: LeakPolicy) -> Self {
        self.config.arena.leak_policy = policy;
        self
    }

    /// Enable or disable nothing-instance access checks.
    pub fn check_nothing_access(mut self, enabled: bool) -> Self {
        self.config.diagnostics.check_nothing_access = enabled;
        self
    }

    /// Abort instead of panicking on fatal faults.
    pub fn abort_on_fatal(mut self, enabled: bool) -> Self {
        self.config.diagnostics.abort_on_fatal = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration, validating it first.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.arena.chunk_size, 64 * 1024);
        assert_eq!(config.arena.max_size, 0);
        assert_eq!(config.arena.leak_policy, LeakPolicy::Warn);
        assert!(!config.diagnostics.abort_on_fatal);
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .arena_chunk_size(4096)
            .arena_max_size(1 << 20)
            .leak_policy(LeakPolicy::Fatal)
            .check_nothing_access(true)
            .log_level(LogLevel::Debug)
            .log_format(LogFormat::Json)
            .build()
            .unwrap();

        assert_eq!(config.arena.chunk_size, 4096);
        assert_eq!(config.arena.max_size, 1 << 20);
        assert_eq!(config.arena.leak_policy, LeakPolicy::Fatal);
        assert!(config.diagnostics.check_nothing_access);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_validation_chunk_too_small() {
        let result = RuntimeConfig::builder().arena_chunk_size(64).build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "arena.chunk_size"
        ));
    }

    #[test]
    fn test_validation_chunk_not_power_of_two() {
        assert!(RuntimeConfig::builder().arena_chunk_size(3000).build().is_err());
    }

    #[test]
    fn test_validation_max_below_chunk() {
        let result = RuntimeConfig::builder()
            .arena_chunk_size(4096)
            .arena_max_size(1024)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().arena_chunk_size(1).build_unchecked();
        assert_eq!(config.arena.chunk_size, 1);
    }

    #[test]
    fn test_leak_policy_from_str() {
        assert_eq!(LeakPolicy::from_str("FATAL"), Some(LeakPolicy::Fatal));
        assert_eq!(LeakPolicy::from_str("warning"), Some(LeakPolicy::Warn));
        assert_eq!(LeakPolicy::from_str("off"), Some(LeakPolicy::Ignore));
        assert_eq!(LeakPolicy::from_str("maybe"), None);
        assert_eq!(LeakPolicy::Fatal.as_str(), "fatal");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "arena.chunk_size".into(),
            message: "must be a power of two".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("arena.chunk_size"));
        assert!(msg.contains("power of two"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        // Without TETHER_* variables set, from_env matches the defaults.
        let config = RuntimeConfig::from_env();
        assert!(config.validate().is_ok());
    }
}
