//! Play session runtime entrypoint wiring REST, WebSocket, SSE and the persistence gateway.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use axum::Router;
use play_session_runtime::{
    config::RuntimeConfig,
    dao::gateway::memory::MemoryGateway,
    routes,
    services::participant_service,
    state::{AppState, SharedState},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_GATEWAY: &str = if cfg!(feature = "mongo-store") {
    "mongo"
} else {
    "memory"
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = RuntimeConfig::load();
    let app_state = AppState::new(config);

    let gateway = env::var("PLAY_GATEWAY").unwrap_or_else(|_| DEFAULT_GATEWAY.into());
    match gateway.as_str() {
        "memory" => {
            info!("using in-memory gateway; nothing survives a restart");
            app_state
                .install_gateway(Arc::new(MemoryGateway::new()))
                .await;
        }
        #[cfg(feature = "mongo-store")]
        "mongo" => spawn_mongo_supervisor(app_state.clone()),
        other => bail!("unsupported PLAY_GATEWAY `{other}`"),
    }

    tokio::spawn(participant_service::run_presence_sweeper(app_state.clone()));

    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Connect to MongoDB in the background; the runtime stays degraded until it succeeds.
#[cfg(feature = "mongo-store")]
fn spawn_mongo_supervisor(state: SharedState) {
    use play_session_runtime::{
        dao::gateway::{
            PlayGateway,
            mongodb::{MongoConfig, MongoPlayGateway},
        },
        dao::storage::StorageError,
        services::gateway_supervisor,
    };

    let uri = env::var("MONGO_URI").unwrap_or_else(|_| "mongodb://localhost:27017".into());
    let db_name = env::var("MONGO_DB").ok();

    let connect = move || {
        let uri = uri.clone();
        let db_name = db_name.clone();
        async move {
            let config = MongoConfig::from_uri(&uri, db_name.as_deref()).await?;
            let gateway = MongoPlayGateway::connect(config).await?;
            Ok::<_, StorageError>(Arc::new(gateway) as Arc<dyn PlayGateway>)
        }
    };
    tokio::spawn(gateway_supervisor::run(state, connect));
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
