use clap::Parser;
use session_server::auth::DevTokenVerifier;
use session_server::config::{ServerConfig, load_config};
use session_server::connection::websocket_handler;
use session_server::rate_limit::RateLimiter;
use session_server::registry::{AppState, SessionRegistry};
use session_server::store::MemStore;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "session-server", about = "Authoritative tactics game session server")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured bind address.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
/// Activates error tracing, loads the configuration, re-materializes any
/// persisted sessions, spawns the registry watchdog and then serves the
/// WebSocket and operator routes.
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

    let args = Args::parse();
    let mut config = match args.config.as_deref() {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(%error, path = %path.display(), "initial config load error");
                panic!("Initial config load error: {}", error);
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    let config = Arc::new(config);

    let store = Arc::new(MemStore::new());
    let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
    let registry = SessionRegistry::new(config.clone(), store.clone(), limiter);
    registry.recover_all();

    let app_state = Arc::new(AppState {
        config: config.clone(),
        store,
        verifier: Arc::new(DevTokenVerifier),
        registry,
    });

    let watchdog_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            watchdog_state.registry.sweep();
        }
    });

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(app_state);

    tracing::info!(bind_addr = config.bind_addr, "session server listening");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap();

    axum::serve(listener, app).await.unwrap();
}

/// Generates a plain-text list of the known non-ended sessions with their
/// phase, member count and liveness, for operators.
async fn sessions_handler(State(state): State<Arc<AppState>>) -> String {
    let rows = match state.store.list_active_sessions() {
        Ok(rows) => rows,
        Err(error) => return format!("session listing failed: {error}"),
    };
    rows.iter()
        .map(|row| {
            let members = state
                .store
                .list_participants(&row.session_id)
                .map(|p| p.len())
                .unwrap_or(0);
            format!(
                "Session: {:<18} Code: {} Phase: {:<8} Members: {:03} is alive: {}",
                row.session_id,
                row.invite_code,
                format!("{:?}", row.phase).to_lowercase(),
                members,
                state.registry.lookup(&row.session_id).is_some(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
