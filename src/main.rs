// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use dotenvy::dotenv;
use http::{header::CONTENT_TYPE, HeaderName, Method};
use tokio::signal::{self, ctrl_c};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use poll_backend::clock::SystemClock;
use poll_backend::config::Config;
use poll_backend::db;
use poll_backend::error::StartupError;
use poll_backend::lifecycle::spawn_sweeper;
use poll_backend::notify::{LogSink, NotificationSink, WhatsAppSink};
use poll_backend::routes::{self, ADMIN_TOKEN_HEADER};
use poll_backend::store::{MemoryStore, PgStore, PollStore};
use poll_backend::{AppState, EngineSettings, PollService};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    dotenv().ok();
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    if let Err(e) = run().await {
        error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::load()?;

    let store: Arc<dyn PollStore> = match config.database_url.as_deref() {
        Some(url) => Arc::new(PgStore::new(db::create_pool(url, config.db_max_connections).await?)),
        None => {
            warn!("DATABASE_URL not set, running on the in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let notifier: Arc<dyn NotificationSink> = match &config.whatsapp {
        Some(whatsapp) => Arc::new(WhatsAppSink::new(whatsapp)?),
        None => Arc::new(LogSink),
    };

    let service = Arc::new(PollService::new(
        store,
        notifier,
        Arc::new(SystemClock),
        EngineSettings {
            auto_activate_polls: config.auto_activate_polls,
            otp_ttl: config.otp_ttl,
            read_retries: config.read_retries,
        },
    ));

    let sweeper = spawn_sweeper(service.clone(), config.sweep_interval);
    info!(interval_secs = config.sweep_interval.as_secs(), "Sweeper started");

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static(ADMIN_TOKEN_HEADER)])
        .max_age(Duration::from_secs(60 * 60));

    let app = routes::create_routes(AppState::new(service, config.admin_token.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let address = SocketAddr::from(([0, 0, 0, 0], config.port));
    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    info!("Server running on {address}");
    axum_server::bind(address)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    sweeper.abort();
    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
