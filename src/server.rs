//! Server module for Beacon
//!
//! Contains configuration loading, store wiring, router assembly and the
//! serve loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::{Extension, Router};
use config::{Config, Environment, File};
use serde::Deserialize;
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use beacon_relay::{SessionRegistry, SessionSettings, SessionStores, ROUND_BYTE_BUDGET};
use beacon_store::{SqliteAttachmentStore, SqliteEventStore, SqliteExecutionRegistry};

use crate::{api, websocket};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Relay tunables
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen host
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://beacon.db?mode=rwc".to_string()
}

/// Relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Per-round replay byte budget
    #[serde(default = "default_replay_round_budget")]
    pub replay_round_budget_bytes: usize,
    /// Minimum interval between heartbeat write-throughs
    #[serde(default = "default_heartbeat_debounce_ms")]
    pub heartbeat_debounce_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            replay_round_budget_bytes: default_replay_round_budget(),
            heartbeat_debounce_ms: default_heartbeat_debounce_ms(),
        }
    }
}

fn default_replay_round_budget() -> usize {
    ROUND_BYTE_BUDGET
}

fn default_heartbeat_debounce_ms() -> u64 {
    30_000
}

impl AppConfig {
    /// Load configuration from an optional file plus `BEACON_*` environment
    /// overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("beacon").required(false)),
        };
        builder
            .add_source(Environment::with_prefix("BEACON").separator("__"))
            .build()
            .context("failed to load configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            replay_round_budget: self.relay.replay_round_budget_bytes,
            heartbeat_debounce: Duration::from_millis(self.relay.heartbeat_debounce_ms),
        }
    }
}

/// Open the database and wire up the SQLite-backed stores.
pub async fn connect_stores(config: &AppConfig) -> Result<SessionStores> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;

    beacon_store::init_schema(&pool).await?;

    Ok(SessionStores {
        events: Arc::new(SqliteEventStore::new(pool.clone())),
        executions: Arc::new(SqliteExecutionRegistry::new(pool.clone())),
        attachments: Arc::new(SqliteAttachmentStore::new(pool)),
    })
}

/// Assemble the HTTP router.
pub fn router(sessions: SessionRegistry) -> Router {
    Router::new()
        .route("/health", get(api::health::health))
        .route(
            "/v1/sessions/:session_id/executions",
            post(api::executions::create_execution),
        )
        .route(
            "/v1/executions/:execution_id",
            get(api::executions::get_execution),
        )
        .route(
            "/v1/sessions/:session_id/observers",
            get(api::executions::observer_count),
        )
        .route(
            "/v1/sessions/:session_id/stream",
            get(websocket::stream::stream_handler),
        )
        .route(
            "/v1/sessions/:session_id/ingest",
            get(websocket::ingest::ingest_handler),
        )
        .layer(Extension(sessions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Run the relay server until shutdown.
pub async fn run(config: AppConfig) -> Result<()> {
    let stores = connect_stores(&config).await?;
    let sessions = SessionRegistry::new(stores, config.session_settings());
    let app = router(sessions);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Beacon relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

/// Create the database schema and exit.
pub async fn init_db(config: AppConfig) -> Result<()> {
    connect_stores(&config).await?;
    info!(url = %config.database.url, "Database schema ready");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
