//! Configuration module for the broker
//!
//! Configuration comes from a YAML file with per-field defaults, layered
//! with env files and well-known deployment variables.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

#[cfg(test)]
mod tests;

use crate::errors::BrokerError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<BrokerConfig, BrokerError> {
    ConfigLoader::from_file(path).await
}
