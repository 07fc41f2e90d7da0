//! chat-identity - Identity and session authority for a chat application

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_identity::{
    api::{self, AppState},
    cache::create_session_store,
    config::Config,
    db::{self, repositories::SqlxUserRepository},
    services::{IdentityService, TokenAuthority},
};

/// Environment variable naming the config file
const CONFIG_PATH_ENV: &str = "CHAT_IDENTITY_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_identity=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting chat-identity...");

    // Load configuration
    let config_path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yml"));
    let config = Config::load_with_env(&config_path)?;
    config.validate()?;
    tracing::info!("Configuration loaded from {}", config_path.display());

    // Initialize database
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("Database connected: {:?}", config.database.driver);

    // Run migrations
    db::migrations::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    // Session store connects lazily on first use
    let sessions = create_session_store(&config.session_store)?;
    tracing::info!(
        "Session store initialized: {:?} (max_retries={})",
        config.session_store.driver,
        sessions.max_retries()
    );

    let users = SqlxUserRepository::boxed(pool.clone());
    let tokens = Arc::new(TokenAuthority::new(
        &config.auth.access_secret,
        &config.auth.refresh_secret,
        config.auth.access_ttl(),
        config.auth.refresh_ttl(),
    ));
    let identity = Arc::new(IdentityService::new(users.clone(), sessions.clone(), tokens));

    let state = AppState {
        identity,
        users,
        sessions,
        request_timeout: config.server.request_timeout(),
    };

    // Build router
    let app = api::build_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.close().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
