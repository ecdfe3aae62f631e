use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pusher_server::admin_api::AdminHttpClient;
use pusher_server::admin_socket::serve_admin;
use pusher_server::back::ws_client::WsBackClient;
use pusher_server::back::{BackClient, BackendDirectory};
use pusher_server::batch::BatchSettings;
use pusher_server::client_socket::serve_client;
use pusher_server::config::{embeddable_allowlist_from_env, load_config};
use pusher_server::embeddable::EmbeddableChecker;
use pusher_server::hand_shake::{JoinQuery, identity_from_query};
use pusher_server::multiplexer::{MultiplexerSettings, SessionMultiplexer};

struct AppState {
    mux: Arc<SessionMultiplexer>,
    batching: BatchSettings,
}

#[tokio::main]
/// Activates error tracing, builds the multiplexer over the configured back
/// pool, spawns the fallback sweep task and serves the front, admin and
/// status routes.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = match load_config("PusherConfig.json").await {
        Ok(config) => config,
        Err(message) => {
            tracing::error!(message, "Initial load error.");
            panic!("Initial load error: {}", message);
        }
    };

    let backs: Vec<Arc<dyn BackClient>> = config
        .back_endpoints
        .iter()
        .map(|endpoint| Arc::new(WsBackClient::new(endpoint)) as Arc<dyn BackClient>)
        .collect();
    let directory = match BackendDirectory::new(backs) {
        Ok(directory) => directory,
        Err(err) => panic!("Back-end directory error: {}", err),
    };
    let admin_api = Arc::new(AdminHttpClient::new(
        &config.admin_api_url,
        &config.admin_api_token,
    ));
    let embeddable = EmbeddableChecker::new(embeddable_allowlist_from_env());
    let mux = SessionMultiplexer::new(
        directory,
        admin_api,
        embeddable,
        MultiplexerSettings {
            forward_unknown_kick: config.forward_unknown_kick,
        },
    );

    // Fallback sweep for rooms and spaces that should have disposed
    // themselves; things are normally handled internally otherwise.
    let sweep_mux = mux.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1200)); // 20 Min
        loop {
            interval.tick().await;
            sweep_mux.sweep().await;
        }
    });

    let state = Arc::new(AppState {
        mux,
        batching: BatchSettings {
            max_batch: config.batch_max_size,
            flush_interval: Duration::from_millis(config.batch_flush_ms),
        },
    });

    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/ws", get(websocket_handler))
        .route("/admin/ws", get(admin_websocket_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}

/// Lists the current rooms and spaces with their population.
async fn status_handler(State(state): State<Arc<AppState>>) -> String {
    state.mux.enlist().await
}

/// Upgrades a front client connection and hands it to the session pumps.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<JoinQuery>,
    ConnectInfo(address): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match identity_from_query(query, address.ip().to_string()) {
        Ok(identity) => {
            let mux = state.mux.clone();
            let batching = state.batching;
            ws.on_upgrade(move |socket| serve_client(socket, mux, identity, batching))
                .into_response()
        }
        Err(message) => {
            tracing::warn!(message, "Rejecting join request.");
            (StatusCode::BAD_REQUEST, message).into_response()
        }
    }
}

/// Upgrades an administrative connection (JSON text protocol).
async fn admin_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mux = state.mux.clone();
    ws.on_upgrade(move |socket| serve_admin(socket, mux))
}
