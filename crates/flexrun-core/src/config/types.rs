//! Configuration types for the broker.
//!
//! Every section has serde defaults, so an empty YAML document yields the
//! same configuration as [`BrokerConfig::default`].

use crate::errors::BrokerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    #[serde(default)]
    pub connections: ConnectionConfig,
    #[serde(default)]
    pub sentinels: SentinelConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory of static frontend assets served for unmatched paths.
    #[serde(default)]
    pub frontend_dir: Option<PathBuf>,
    /// Allowed CORS origins; `None` allows any origin.
    #[serde(default)]
    pub cors_origins: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
}

impl ServerSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Limits and housekeeping for executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock budget per execution, excluding time spent waiting for input.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Floor applied to the remaining budget when the clock pauses.
    #[serde(default = "default_min_remaining_ms")]
    pub min_remaining_ms: u64,
    #[serde(default = "default_max_code_length")]
    pub max_code_length: usize,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Source files older than this are swept before each submission.
    #[serde(default = "default_temp_retention_secs")]
    pub temp_retention_secs: u64,
    #[serde(default = "default_source_prefix")]
    pub source_prefix: String,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
    /// Extra attempts after the first input request while it stays unanswered.
    #[serde(default = "default_input_request_retries")]
    pub input_request_retries: u32,
    /// Base delay between input request attempts, doubled each attempt.
    #[serde(default = "default_input_request_backoff_ms")]
    pub input_request_backoff_ms: u64,
    /// How long to wait for output readers to drain after the process exits.
    #[serde(default = "default_stream_drain_ms")]
    pub stream_drain_ms: u64,
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_remaining(&self) -> Duration {
        Duration::from_millis(self.min_remaining_ms)
    }

    pub fn temp_retention(&self) -> Duration {
        Duration::from_secs(self.temp_retention_secs)
    }

    pub fn input_request_backoff(&self) -> Duration {
        Duration::from_millis(self.input_request_backoff_ms)
    }

    pub fn stream_drain(&self) -> Duration {
        Duration::from_millis(self.stream_drain_ms)
    }
}

/// How the interpreter subprocess is launched.
///
/// The command line is `program args... entry_script <source file> mode_flag`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the entry script, such as `-u` for unbuffered output.
    #[serde(default = "default_interpreter_args")]
    pub args: Vec<String>,
    #[serde(default = "default_entry_script")]
    pub entry_script: PathBuf,
    #[serde(default = "default_mode_flag")]
    pub mode_flag: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_interpreter_env")]
    pub env: HashMap<String, String>,
}

/// Duplex connection liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Consecutive unanswered pings before a connection is terminated.
    #[serde(default = "default_missed_pong_limit")]
    pub missed_pong_limit: u32,
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// In-band tokens the interpreter prints on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default = "default_input_request_token")]
    pub input_request: String,
    #[serde(default = "default_input_received_token")]
    pub input_received: String,
    /// Informal phrasings treated like the input request token.
    #[serde(default = "default_fallback_phrases")]
    pub fallback_phrases: Vec<String>,
}

/// Environment variables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub env_files: Vec<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            frontend_dir: None,
            cors_origins: None,
            enable_logging: true,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            min_remaining_ms: default_min_remaining_ms(),
            max_code_length: default_max_code_length(),
            temp_dir: default_temp_dir(),
            temp_retention_secs: default_temp_retention_secs(),
            source_prefix: default_source_prefix(),
            source_extension: default_source_extension(),
            input_request_retries: default_input_request_retries(),
            input_request_backoff_ms: default_input_request_backoff_ms(),
            stream_drain_ms: default_stream_drain_ms(),
        }
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_interpreter_args(),
            entry_script: default_entry_script(),
            mode_flag: default_mode_flag(),
            working_dir: None,
            env: default_interpreter_env(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_pong_limit: default_missed_pong_limit(),
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            input_request: default_input_request_token(),
            input_received: default_input_received_token(),
            fallback_phrases: default_fallback_phrases(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.execution.timeout_ms == 0 {
            return Err(BrokerError::ConfigError(
                "execution.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.execution.min_remaining_ms > self.execution.timeout_ms {
            return Err(BrokerError::ConfigError(
                "execution.min_remaining_ms cannot exceed execution.timeout_ms".to_string(),
            ));
        }
        if self.execution.max_code_length == 0 {
            return Err(BrokerError::ConfigError(
                "execution.max_code_length must be greater than zero".to_string(),
            ));
        }
        if self.interpreter.program.trim().is_empty() {
            return Err(BrokerError::ConfigError(
                "interpreter.program cannot be empty".to_string(),
            ));
        }
        if self.connections.heartbeat_interval_secs == 0 {
            return Err(BrokerError::ConfigError(
                "connections.heartbeat_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.connections.missed_pong_limit == 0 {
            return Err(BrokerError::ConfigError(
                "connections.missed_pong_limit must be at least 1".to_string(),
            ));
        }
        if self.sentinels.input_request.is_empty() || self.sentinels.input_received.is_empty() {
            return Err(BrokerError::ConfigError(
                "sentinel tokens cannot be empty".to_string(),
            ));
        }
        if self.sentinels.fallback_phrases.iter().any(|p| p.is_empty()) {
            return Err(BrokerError::ConfigError(
                "sentinels.fallback_phrases cannot contain empty phrases".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 3000 }
fn default_true() -> bool { true }
fn default_timeout_ms() -> u64 { 30_000 }
fn default_min_remaining_ms() -> u64 { 1_000 }
fn default_max_code_length() -> usize { 50_000 }
fn default_temp_dir() -> PathBuf { PathBuf::from("temp") }
fn default_temp_retention_secs() -> u64 { 3_600 }
fn default_source_prefix() -> String { "code_".to_string() }
fn default_source_extension() -> String { "lx".to_string() }
fn default_input_request_retries() -> u32 { 3 }
fn default_input_request_backoff_ms() -> u64 { 1_000 }
fn default_stream_drain_ms() -> u64 { 2_000 }
fn default_program() -> String { "python3".to_string() }
fn default_interpreter_args() -> Vec<String> { vec!["-u".to_string()] }
fn default_entry_script() -> PathBuf { PathBuf::from("../compiler/src/main.py") }
fn default_mode_flag() -> Option<String> { Some("--web".to_string()) }
fn default_heartbeat_interval_secs() -> u64 { 30 }
fn default_missed_pong_limit() -> u32 { 2 }
fn default_input_request_token() -> String { "__FLEX_INPUT_REQUEST__".to_string() }
fn default_input_received_token() -> String { "__FLEX_INPUT_RECEIVED__".to_string() }
fn default_log_level() -> String { "info".to_string() }

fn default_fallback_phrases() -> Vec<String> {
    vec![
        "Waiting for input".to_string(),
        "scan()".to_string(),
        "da5l()".to_string(),
    ]
}

fn default_interpreter_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("USE_AI".to_string(), "false".to_string());
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    env
}
