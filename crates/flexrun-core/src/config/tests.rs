//! Tests for configuration parsing, validation and environment overrides

#[cfg(test)]
mod tests {
    use super::super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    const OVERRIDE_VARS: &[&str] = &[
        ENV_PORT,
        ENV_HOST,
        ENV_PYTHON_PATH,
        ENV_COMPILER_PATH,
        ENV_USE_AI,
        ENV_TEMP_DIR,
        ENV_FRONTEND_DIR,
    ];

    fn clear_override_vars() {
        for key in OVERRIDE_VARS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_empty_document_yields_defaults() {
        clear_override_vars();
        let config = ConfigLoader::from_str("").unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.bind_addr(), "0.0.0.0:3000");
        assert_eq!(config.execution.timeout_ms, 30_000);
        assert_eq!(config.execution.min_remaining_ms, 1_000);
        assert_eq!(config.execution.max_code_length, 50_000);
        assert_eq!(config.execution.temp_retention_secs, 3_600);
        assert_eq!(config.execution.input_request_retries, 3);
        assert_eq!(config.interpreter.program, "python3");
        assert_eq!(config.interpreter.mode_flag.as_deref(), Some("--web"));
        assert_eq!(config.interpreter.env.get("USE_AI").map(String::as_str), Some("false"));
        assert_eq!(config.connections.heartbeat_interval_secs, 30);
        assert_eq!(config.connections.missed_pong_limit, 2);
        assert_eq!(config.sentinels.input_request, "__FLEX_INPUT_REQUEST__");
        assert_eq!(config.sentinels.input_received, "__FLEX_INPUT_RECEIVED__");
        assert_eq!(config.sentinels.fallback_phrases.len(), 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    #[serial]
    fn test_partial_yaml_keeps_other_defaults() {
        clear_override_vars();
        let yaml = r#"
execution:
  timeout_ms: 5000
interpreter:
  program: /usr/bin/python3.11
  mode_flag: null
"#;
        let config = ConfigLoader::from_str(yaml).unwrap();

        assert_eq!(config.execution.timeout_ms, 5000);
        assert_eq!(config.execution.max_code_length, 50_000);
        assert_eq!(config.interpreter.program, "/usr/bin/python3.11");
        assert!(config.interpreter.mode_flag.is_none());
        assert_eq!(config.interpreter.args, vec!["-u".to_string()]);
    }

    #[test]
    #[serial]
    fn test_invalid_yaml_is_config_error() {
        clear_override_vars();
        let result = ConfigLoader::from_str("execution: [unterminated");
        assert!(matches!(result, Err(crate::errors::BrokerError::ConfigError(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = BrokerConfig::default();
        assert!(config.validate().is_ok());

        config.execution.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.interpreter.program = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.connections.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.sentinels.input_request.clear();
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.execution.min_remaining_ms = config.execution.timeout_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_PORT, "8080"),
            (ENV_PYTHON_PATH, "/opt/python/bin/python3"),
            (ENV_COMPILER_PATH, "/srv/flex"),
            (ENV_USE_AI, "true"),
            (ENV_TEMP_DIR, ""),
        ]
        .into_iter()
        .collect();

        let mut config = BrokerConfig::default();
        ConfigLoader::apply_overrides_with(&mut config, |key| {
            vars.get(key).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.interpreter.program, "/opt/python/bin/python3");
        assert_eq!(
            config.interpreter.entry_script,
            PathBuf::from("/srv/flex/src/main.py")
        );
        assert_eq!(config.interpreter.working_dir, Some(PathBuf::from("/srv/flex")));
        assert_eq!(config.interpreter.env.get("USE_AI").map(String::as_str), Some("true"));
        // Blank values are ignored
        assert_eq!(config.execution.temp_dir, PathBuf::from("temp"));
    }

    #[test]
    fn test_invalid_port_override() {
        let mut config = BrokerConfig::default();
        let result = ConfigLoader::apply_overrides_with(&mut config, |key| {
            (key == ENV_PORT).then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_env_file_feeds_overrides() {
        clear_override_vars();
        let mut env_file = NamedTempFile::new().unwrap();
        writeln!(env_file, "# deployment settings").unwrap();
        writeln!(env_file, "PORT=4100").unwrap();
        writeln!(env_file, "export USE_FLEX_AI=\"true\"").unwrap();

        let mut config_file = NamedTempFile::new().unwrap();
        writeln!(config_file, "environment:").unwrap();
        writeln!(config_file, "  env_files:").unwrap();
        writeln!(config_file, "    - {}", env_file.path().display()).unwrap();
        writeln!(config_file, "  variables:").unwrap();
        writeln!(config_file, "    FLEXRUN_TEMP_DIR: /tmp/flexrun-test").unwrap();

        let config = load_config(config_file.path()).await.unwrap();

        assert_eq!(config.server.port, 4100);
        assert_eq!(config.interpreter.env.get("USE_AI").map(String::as_str), Some("true"));
        assert_eq!(config.execution.temp_dir, PathBuf::from("/tmp/flexrun-test"));

        clear_override_vars();
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_file_falls_back_to_defaults() {
        clear_override_vars();
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::from_file_or_default(dir.path().join("missing.yaml"))
            .await
            .unwrap();
        assert_eq!(config.server.port, 3000);

        let error = ConfigLoader::from_file(dir.path().join("missing.yaml")).await;
        assert!(error.is_err());
    }
}
