//! Server accept loops
//!
//! The channel server listens on the configured port, upgrades each request
//! at `/<prefix>/v1/`, and hands the socket to a `ConnectionHandler` wired
//! to the shared provider singletons. The HTTP server carries the bootstrap
//! and vision endpoints. The device-id → connection map is the only
//! cross-connection shared structure and is mutated only on connect and
//! disconnect under a single mutex.

pub mod auth;
pub mod http;

use anyhow::{Context, Result};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::{ConnectionHandler, ConnectionParams, ConnectionState, Outbound};
use crate::providers::{ProviderRegistry, ProviderSet};

/// Handle kept per connected device for control-plane pushes.
pub struct ConnectionEntry {
    pub session_id: String,
    pub outbound: mpsc::Sender<Outbound>,
}

/// Shared server state. Connections hold a weak back reference; the server
/// owns the map from device id to connection.
pub struct ServerContext {
    config: Arc<RwLock<Arc<Config>>>,
    config_path: Option<PathBuf>,
    pub registry: ProviderRegistry,
    pub providers: ProviderSet,
    pub auth: auth::AuthPolicy,
    connections: Mutex<HashMap<String, ConnectionEntry>>,
}

impl ServerContext {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Arc<Self>> {
        let registry = ProviderRegistry::default();
        let providers = registry
            .build(&config)
            .context("Failed to build providers")?;
        Ok(Arc::new(Self {
            config: Arc::new(RwLock::new(Arc::new(config))),
            config_path,
            registry,
            providers,
            auth: auth::AuthPolicy,
            connections: Mutex::new(HashMap::new()),
        }))
    }

    /// Current config snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().unwrap().clone()
    }

    /// Live config handle shared with connections.
    pub fn config_handle(&self) -> Arc<RwLock<Arc<Config>>> {
        self.config.clone()
    }

    /// Hot-reload the config file. In-flight turns keep the snapshot they
    /// started with; subsequent turns observe the new config. Process-wide
    /// caches are flushed.
    pub async fn update_config(&self) -> Result<()> {
        let path = self
            .config_path
            .as_ref()
            .context("No config file to reload")?;
        let new_config = Config::load(path)?;
        *self.config.write().unwrap() = Arc::new(new_config);
        crate::connection::wakeup::WAKEUP_CACHE.flush();
        info!("Configuration reloaded from {}", path.display());
        Ok(())
    }

    /// Push a control frame to every tracked connection.
    pub async fn broadcast(&self, control: Value) {
        let connections = self.connections.lock().await;
        for (device_id, entry) in connections.iter() {
            if entry
                .outbound
                .send(Outbound::Json(control.clone()))
                .await
                .is_err()
            {
                warn!("Broadcast to {} failed", device_id);
            }
        }
    }

    pub async fn register_connection(&self, device_id: &str, state: &Arc<ConnectionState>) {
        let mut connections = self.connections.lock().await;
        if connections.contains_key(device_id) {
            info!("Device {} reconnected; replacing map entry", device_id);
        }
        connections.insert(
            device_id.to_string(),
            ConnectionEntry {
                session_id: state.session_id.clone(),
                outbound: state.outbound(),
            },
        );
    }

    /// Remove the map entry, but only for the session that owns it; a
    /// reconnect may already have replaced it.
    pub async fn unregister_connection(&self, device_id: &str, session_id: &str) {
        let mut connections = self.connections.lock().await;
        if connections
            .get(device_id)
            .map(|e| e.session_id == session_id)
            .unwrap_or(false)
        {
            connections.remove(device_id);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Re-exec the current binary and exit; replies must be flushed first.
    pub fn restart(&self) {
        tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            info!("Re-executing server binary");
            match std::env::current_exe() {
                Ok(exe) => {
                    let args: Vec<String> = std::env::args().skip(1).collect();
                    match std::process::Command::new(exe).args(&args).spawn() {
                        Ok(_) => std::process::exit(0),
                        Err(e) => warn!("Restart failed: {}", e),
                    }
                }
                Err(e) => warn!("Restart failed, no current exe: {}", e),
            }
        });
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(ctx): State<Arc<ServerContext>>,
) -> Response {
    let params = ConnectionParams::resolve(&headers, &query, addr.ip().to_string());
    ws.on_upgrade(move |socket| ConnectionHandler::handle(socket, params, ctx))
}

/// Run the channel accept loop until the task is cancelled.
pub async fn start_ws_server(ctx: Arc<ServerContext>) -> Result<()> {
    let config = ctx.config();
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid channel listen address")?;

    let app = Router::new()
        .route(&config.ws_path(), get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx);

    info!("Channel endpoint on ws://{}{}", addr, config.ws_path());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind channel port")?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Channel server failed")
}

/// Run the bootstrap/vision HTTP server until the task is cancelled.
pub async fn start_http_server(ctx: Arc<ServerContext>) -> Result<()> {
    let config = ctx.config();
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.http_port)
        .parse()
        .context("Invalid HTTP listen address")?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ota_path = format!("/{}/ota/", config.server.ws_prefix);
    let app = Router::new()
        .route(&ota_path, post(http::ota_post).get(http::ota_get))
        .route("/mcp/vision/explain", post(http::vision_explain))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx);

    info!("Bootstrap endpoint on http://{}{}", addr, ota_path);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind HTTP port")?;
    axum::serve(listener, app)
        .await
        .context("HTTP server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_build_and_config_snapshot() {
        let ctx = ServerContext::new(Config::load_default(), None).unwrap();
        assert_eq!(ctx.config().server.port, 8000);
        assert_eq!(ctx.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_config_without_path_fails() {
        let ctx = ServerContext::new(Config::load_default(), None).unwrap();
        assert!(ctx.update_config().await.is_err());
    }

    #[tokio::test]
    async fn test_update_config_reloads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server:\n  port: 9100\n").unwrap();

        let ctx =
            ServerContext::new(Config::load(&path).unwrap(), Some(path.clone())).unwrap();
        assert_eq!(ctx.config().server.port, 9100);

        std::fs::write(&path, "server:\n  port: 9200\n").unwrap();
        ctx.update_config().await.unwrap();
        assert_eq!(ctx.config().server.port, 9200);
    }
}
