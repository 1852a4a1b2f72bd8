//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, MturkConnector, OtreeAdapter},
    config::Config,
    error::ApiError,
    web::{
        completion_url_handler, expire_handler, import_session_handler, pay_handler,
        payments_handler, publish_handler, redirect_handler, reject_handler,
        require_experimenter, rest::ApiDoc, session_status_handler, state::AppState,
    },
};
use axum::{
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool.clone()));
    info!("Running database migrations...");
    db_adapter.migrate().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let http_client = reqwest::Client::new();
    let hosting_adapter = Arc::new(OtreeAdapter::new(http_client.clone()));
    let marketplace_connector = Arc::new(MturkConnector::new(
        http_client,
        config.marketplace_sandbox_endpoint.clone(),
        config.marketplace_live_endpoint.clone(),
    ));

    // --- 4. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        db: db_adapter,
        hosting: hosting_adapter,
        marketplace: marketplace_connector,
        config: config.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);

    // --- 5. Create the Web Router ---
    // Public routes (workers arrive here from the marketplace)
    let public_routes = Router::new().route("/redirect/{session_id}", get(redirect_handler));

    // Experimenter routes (API token required)
    let experimenter_routes = Router::new()
        .route("/sites/{site_id}/sessions", post(import_session_handler))
        .route("/sessions/{code}", get(session_status_handler))
        .route("/sessions/{code}/completion-url", post(completion_url_handler))
        .route("/sessions/{code}/publish", post(publish_handler))
        .route("/sessions/{code}/expire", post(expire_handler))
        .route("/sessions/{code}/payments", get(payments_handler))
        .route("/sessions/{code}/pay", post(pay_handler))
        .route("/sessions/{code}/reject", post(reject_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_experimenter,
        ));

    // Combine API routes
    let api_router = Router::new()
        .merge(public_routes)
        .merge(experimenter_routes)
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
