mod bot;
mod chat;
mod config;
mod db;
mod errors;
mod gateway_client;
mod handlers;
mod instance;
mod models;
mod phone;
mod services;
mod webhook_handler;
mod webhook_models;

use axum::{
    routing::{get, post},
    Router,
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::gateway_client::EvolutionClient;

/// Main entry point for the application.
///
/// Initializes logging, configuration, the database pool, the gateway
/// client and the CNPJ cache, then starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_parceiros_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    // CNPJ registry response cache (1 hour TTL, 10k max entries)
    let cnpj_cache = Cache::builder()
        .time_to_live(Duration::from_secs(3600))
        .max_capacity(10_000)
        .build();
    tracing::info!("CNPJ lookup cache initialized (1h TTL)");

    // WhatsApp gateway client
    let gateway = EvolutionClient::new(
        config.evolution_base_url.clone(),
        config.evolution_api_key.clone(),
    )
    .map_err(|e| anyhow::anyhow!("Failed to initialize gateway client: {}", e))?;
    tracing::info!("Gateway client initialized: {}", config.evolution_base_url);

    // Build application state
    let app_state = Arc::new(handlers::AppState {
        db: db.pool.clone(),
        config: config.clone(),
        gateway,
        cnpj_cache,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        // Instance lifecycle
        .route("/api/v1/whatsapp/connect", post(handlers::connect_whatsapp))
        .route("/api/v1/whatsapp/status", get(handlers::whatsapp_status))
        .route("/api/v1/whatsapp/qr", get(handlers::whatsapp_qr))
        .route(
            "/api/v1/whatsapp/disconnect",
            post(handlers::disconnect_whatsapp),
        )
        // Chat
        .route(
            "/api/v1/chat/conversations",
            get(handlers::list_conversations),
        )
        .route(
            "/api/v1/chat/:parceiro_id/messages",
            get(handlers::list_messages).post(handlers::send_message),
        )
        // CNPJ bot
        .route(
            "/api/v1/chat/:parceiro_id/cnpj/check",
            post(handlers::check_cnpj),
        )
        .route(
            "/api/v1/chat/:parceiro_id/cnpj/create",
            post(handlers::create_indication),
        )
        .layer(
            ServiceBuilder::new()
                // Request size limit: 5MB max payload (prevents memory exhaustion)
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // The gateway retries every non-200, so its webhook must never see a
    // 429 from the per-IP limiter. Body limit still applies.
    let webhook_routes = Router::new()
        .route(
            "/api/v1/webhooks/evolution",
            post(webhook_handler::evolution_webhook),
        )
        .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024));

    // Build final app with health check bypassing the rate limiter
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(webhook_routes)
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
