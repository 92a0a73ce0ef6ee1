use nmea_core::{config::load_config, FileConfigStore, RelayConfig};
use nmea_protocol::{HistoryResponse, StatusSnapshot};
use nmea_server::{
    run_rate_updates, BroadcastPublisher, ConfigWatcher, ConnectionManager, DefaultLauncher,
    EngineState, PushServer,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
struct AppState {
    manager: Arc<ConnectionManager>,
    storage: Arc<FileConfigStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("NMEA_CONFIG").unwrap_or_else(|_| ".env".into());
    let storage = Arc::new(FileConfigStore::new(&config_path));

    // Load before tracing is up so DEBUG can pick the default filter
    let (config, warnings) = match load_config(storage.as_ref(), &RelayConfig::default()) {
        Ok(loaded) => loaded,
        Err(e) => (
            RelayConfig::default(),
            vec![format!("{}: {}, using defaults", config_path, e)],
        ),
    };

    let default_filter = if config.debug {
        "info,nmea_server=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("NMEA relay starting (config: {})", config_path);
    for warning in warnings {
        tracing::warn!("Config: {}", warning);
    }

    let ws_addr = SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));

    // Engine
    let publisher = BroadcastPublisher::default();
    let state = Arc::new(EngineState::new(config, Arc::new(publisher.clone())));
    let manager = Arc::new(ConnectionManager::new(state.clone(), DefaultLauncher::default()));
    let report = manager.reconcile().await;
    tracing::info!("Listeners started: {:?}", report.started);

    let stop = state.shutdown_signal().clone();

    // Config reload and supervision
    let watcher = ConfigWatcher::new(storage.clone(), manager.clone());
    let watcher_handle = tokio::spawn(watcher.run(stop.clone()));
    tokio::spawn(run_rate_updates(state.statistics().clone(), stop.clone()));

    // WebSocket push
    let push = PushServer::bind(ws_addr, publisher, manager.clone()).await?;
    let push_handle = tokio::spawn(push.run(stop.clone()));

    // HTTP API
    let app_state = AppState {
        manager: manager.clone(),
        storage,
    };
    let http_handle = tokio::spawn(async move {
        if let Err(e) = start_http_server(http_addr, app_state).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tracing::info!("NMEA relay ready");
    tracing::info!("   WebSocket: ws://localhost:{}", ws_addr.port());
    tracing::info!("   Status:    http://localhost:{}/api/status", http_addr.port());
    tracing::info!("   History:   http://localhost:{}/api/nmea_history", http_addr.port());
    tracing::info!("   Config:    POST http://localhost:{}/api/config", http_addr.port());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = push_handle => {
            tracing::warn!("Push server stopped");
        }
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
    }

    manager.shutdown().await;
    watcher_handle.await.ok();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Start the HTTP API server
async fn start_http_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/nmea_history", get(history_handler))
        .route("/api/config", post(config_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.manager.get_status())
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_count")]
    count: usize,
}

fn default_history_count() -> usize {
    50
}

async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let emitter = state.manager.state().emitter();
    let entries = emitter.get_history(query.count);
    Json(HistoryResponse::new(&entries, emitter.history_len()))
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

async fn config_handler(
    State(state): State<AppState>,
    Json(updates): Json<BTreeMap<String, String>>,
) -> (StatusCode, Json<ConfigUpdateResponse>) {
    match state.manager.update_config(state.storage.as_ref(), updates).await {
        Ok((report, warnings)) => {
            tracing::info!(
                "Config updated: started {:?}, stopped {:?}",
                report.started,
                report.stopped
            );
            (
                StatusCode::OK,
                Json(ConfigUpdateResponse {
                    success: true,
                    message: Some("Configuration saved and applied".to_string()),
                    error: None,
                    warnings,
                }),
            )
        }
        Err(e) => {
            tracing::error!("Config update failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ConfigUpdateResponse {
                    success: false,
                    message: None,
                    error: Some(e.to_string()),
                    warnings: Vec::new(),
                }),
            )
        }
    }
}
