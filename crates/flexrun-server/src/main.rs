//! flexrun-server binary
//!
//! Runs the execution broker behind its HTTP and WebSocket API.

use anyhow::Result;
use clap::Parser;
use flexrun_core::{ConfigLoader, ConnectionMultiplexer, ExecutionRegistry, ProcessSupervisor};
use flexrun_server::{shutdown_signal, FlexServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "flexrun - run Flex programs for the web editor")]
struct Cli {
    #[clap(long, short, default_value = "flexrun.yaml", help = "Configuration file; built-in defaults are used when it does not exist")]
    config: PathBuf,

    #[clap(long, help = "Listen address, overrides server.host and server.port")]
    bind_addr: Option<String>,

    #[clap(long, short, help = "Log level, overrides logging.level")]
    log_level: Option<String>,

    #[clap(long, help = "Directory of static frontend files")]
    frontend_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::from_file_or_default(&cli.config).await?;

    // Initialize logger; RUST_LOG still wins over both settings
    let log_level = cli.log_level.as_deref().unwrap_or(config.logging.level.as_str());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if cli.config.exists() {
        log::info!("Loaded configuration from {}", cli.config.display());
    } else {
        log::warn!(
            "Config file {} not found, using built-in defaults",
            cli.config.display()
        );
    }

    let mut server_config = ServerConfig::from_settings(&config.server)?;
    if let Some(addr) = &cli.bind_addr {
        server_config = server_config.with_bind_addr_str(addr)?;
    }
    if let Some(dir) = cli.frontend_dir {
        server_config = server_config.with_frontend_dir(dir);
    }

    log::info!("Configuration:");
    log::info!("  Bind address: {}", server_config.bind_addr);
    log::info!(
        "  Interpreter: {} {}",
        config.interpreter.program,
        config.interpreter.entry_script.display()
    );
    log::info!("  Execution timeout: {}ms", config.execution.timeout_ms);
    log::info!("  Max code length: {}", config.execution.max_code_length);
    log::info!(
        "  Heartbeat interval: {}s",
        config.connections.heartbeat_interval_secs
    );

    let registry = ExecutionRegistry::new();
    let multiplexer = Arc::new(ConnectionMultiplexer::new(registry.clone(), &config));
    let supervisor = ProcessSupervisor::new(&config, registry, multiplexer);

    supervisor.workspace().ensure_dir().await?;
    let swept = supervisor.workspace().sweep_stale().await;
    log::info!(
        "  Temp directory: {} ({} stale files removed)",
        supervisor.workspace().dir().display(),
        swept
    );

    let server = FlexServer::new(supervisor, server_config);
    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}
