//! Configuration loader for YAML files and environment resolution
//!
//! Loading happens in three steps: the YAML document is parsed, the
//! `environment` section is exported to the process (env files first, then
//! inline variables), and finally well-known deployment variables such as
//! `PORT` or `PYTHON_PATH` override the parsed values.

use crate::config::types::*;
use crate::errors::BrokerError;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable overriding `server.port`.
pub const ENV_PORT: &str = "PORT";
/// Environment variable overriding `server.host`.
pub const ENV_HOST: &str = "HOST";
/// Environment variable overriding `interpreter.program`.
pub const ENV_PYTHON_PATH: &str = "PYTHON_PATH";
/// Environment variable pointing at the compiler checkout.
pub const ENV_COMPILER_PATH: &str = "FLEX_COMPILER_PATH";
/// Environment variable forwarded to the interpreter as `USE_AI`.
pub const ENV_USE_AI: &str = "USE_FLEX_AI";
/// Environment variable overriding `execution.temp_dir`.
pub const ENV_TEMP_DIR: &str = "FLEXRUN_TEMP_DIR";
/// Environment variable overriding `server.frontend_dir`.
pub const ENV_FRONTEND_DIR: &str = "FLEXRUN_FRONTEND_DIR";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<BrokerConfig, BrokerError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            BrokerError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML file, falling back to defaults when it does not exist.
    pub async fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<BrokerConfig, BrokerError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            return Self::from_file(path).await;
        }

        log::warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        let mut config = BrokerConfig::default();
        Self::resolve_environment(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<BrokerConfig, BrokerError> {
        // serde_yaml maps an empty document to unit, not to an empty mapping
        let mut config: BrokerConfig = if content.trim().is_empty() {
            BrokerConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                BrokerError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };

        Self::resolve_environment(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Export the `environment` section and apply deployment overrides.
    fn resolve_environment(config: &mut BrokerConfig) -> Result<(), BrokerError> {
        for env_file in &config.environment.env_files {
            if env_file.exists() {
                Self::load_env_file(env_file)?;
            } else {
                log::debug!("Skipping missing env file {}", env_file.display());
            }
        }

        for (key, value) in &config.environment.variables {
            env::set_var(key, value);
        }

        Self::apply_overrides_with(config, |key| env::var(key).ok())
    }

    /// Apply deployment overrides using `lookup` to read variables.
    pub fn apply_overrides_with<F>(config: &mut BrokerConfig, lookup: F) -> Result<(), BrokerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = lookup(ENV_PORT) {
            config.server.port = port.trim().parse().map_err(|e| {
                BrokerError::ConfigError(format!("Invalid {} value '{}': {}", ENV_PORT, port, e))
            })?;
        }

        if let Some(host) = lookup(ENV_HOST) {
            config.server.host = host;
        }

        if let Some(program) = lookup(ENV_PYTHON_PATH) {
            config.interpreter.program = program;
        }

        if let Some(compiler_root) = lookup(ENV_COMPILER_PATH) {
            let root = PathBuf::from(compiler_root);
            config.interpreter.entry_script = root.join("src").join("main.py");
            config.interpreter.working_dir = Some(root);
        }

        if let Some(use_ai) = lookup(ENV_USE_AI) {
            config.interpreter.env.insert("USE_AI".to_string(), use_ai);
        }

        if let Some(temp_dir) = lookup(ENV_TEMP_DIR) {
            config.execution.temp_dir = PathBuf::from(temp_dir);
        }

        if let Some(frontend_dir) = lookup(ENV_FRONTEND_DIR) {
            config.server.frontend_dir = Some(PathBuf::from(frontend_dir));
        }

        Ok(())
    }

    /// Load a `KEY=VALUE` env file into the process environment
    fn load_env_file<P: AsRef<Path>>(path: P) -> Result<(), BrokerError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BrokerError::ConfigError(format!(
                "Failed to read env file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().trim_start_matches("export ").trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                env::set_var(key, value);
            }
        }

        Ok(())
    }
}
