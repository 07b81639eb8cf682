//! HTTP and WebSocket front end of the flexrun execution broker.
//!
//! Browsers submit programs over `/api/execute`, answer input requests over
//! `/api/input` or the `/ws` duplex channel, and receive streamed output on
//! the same channel. All execution state lives in the [`ProcessSupervisor`]
//! shared through [`AppState`].

pub mod error;
pub mod handlers;
pub mod ws;

pub use error::{Result, ServerError};

use axum::http::Method;
use axum::routing::{get, post};
use axum::{middleware, Router};
use flexrun_core::config::ServerSettings;
use flexrun_core::ProcessSupervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Routes polled by the frontend; their request logs go to debug.
const POLLING_ROUTES: [&str; 2] = ["/api/execution-status/", "/api/input-status"];

/// Configuration for the HTTP listener.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Enable request logging
    pub enable_logging: bool,
    /// Static frontend served for unmatched paths
    pub frontend_dir: Option<PathBuf>,
    /// How long shutdown waits for executions to tear down
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            cors_origins: None,
            enable_logging: true,
            frontend_dir: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `server` section of the broker configuration.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        let config = Self::new()
            .with_bind_addr_str(&settings.bind_addr())?
            .with_logging(settings.enable_logging);
        let config = match &settings.cors_origins {
            Some(origins) => config.with_cors_origins(origins.clone()),
            None => config,
        };
        Ok(match &settings.frontend_dir {
            Some(dir) => config.with_frontend_dir(dir.clone()),
            None => config,
        })
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address '{}': {}", addr, e)))?;
        Ok(self)
    }

    /// Set allowed CORS origins.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Enable or disable request logging.
    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    pub fn with_frontend_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.frontend_dir = Some(dir.into());
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: ProcessSupervisor,
}

/// The broker's web server.
pub struct FlexServer {
    supervisor: ProcessSupervisor,
    config: ServerConfig,
}

impl FlexServer {
    pub fn new(supervisor: ProcessSupervisor, config: ServerConfig) -> Self {
        Self { supervisor, config }
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            supervisor: self.supervisor.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(handlers::health_handler))
            .route("/api/status", get(handlers::health_handler))
            .route("/api/execute", post(handlers::execute_handler))
            .route("/api/input", post(handlers::input_handler))
            .route(
                "/api/execution-status/{id}",
                get(handlers::execution_status_handler),
            )
            .route("/api/input-status", get(handlers::input_status_handler))
            .route("/api/test-input", get(handlers::test_input_handler))
            .route("/ws", get(ws::ws_handler))
            .with_state(state);

        if let Some(dir) = &self.config.frontend_dir {
            router = router.fallback_service(ServeDir::new(dir));
        }

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();
                    let polling = method == Method::GET
                        && POLLING_ROUTES.iter().any(|route| uri.path().starts_with(route));

                    if polling {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    let duration = start.elapsed();

                    if polling {
                        log::debug!(
                            "Response {} {} in {:?}",
                            request_id,
                            response.status(),
                            duration
                        );
                    } else {
                        log::info!(
                            "Response {} {} in {:?}",
                            request_id,
                            response.status(),
                            duration
                        );
                    }

                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        let cors_layer = if let Some(ref origins) = self.config.cors_origins {
            let origins: std::result::Result<Vec<_>, _> =
                origins.iter().map(|s| s.parse()).collect();
            match origins {
                Ok(origins) => CorsLayer::new()
                    .allow_origin(origins)
                    .allow_methods(Any)
                    .allow_headers(Any),
                Err(_) => {
                    log::warn!("Invalid CORS origin configured, allowing any origin");
                    CorsLayer::permissive()
                }
            }
        } else {
            CorsLayer::permissive()
        };
        router.layer(cors_layer)
    }

    /// Serve until `shutdown_signal` resolves, then stop every execution.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        log::info!("flexrun server listening on {}", self.config.bind_addr);
        log::info!("Execute endpoint: http://{}/api/execute", self.config.bind_addr);
        log::info!("WebSocket endpoint: ws://{}/ws", self.config.bind_addr);
        if let Some(dir) = &self.config.frontend_dir {
            log::info!("Serving frontend from {}", dir.display());
        }

        // Executions and sockets must end first, otherwise open connections
        // keep the graceful shutdown waiting forever
        let supervisor = self.supervisor.clone();
        let grace = self.config.shutdown_grace;
        let shutdown = async move {
            shutdown_signal.await;
            supervisor.shutdown(grace).await;
            supervisor.multiplexer().disconnect_all();
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("flexrun server shut down gracefully");
        Ok(())
    }
}

/// Utility function to create a shutdown signal from Ctrl+C.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
