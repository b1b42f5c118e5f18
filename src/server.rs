//! # Server Configuration
//!
//! Router, shared state and OpenAPI document of the repo-sync HTTP surface.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers;
use crate::queue::DbJobQueue;
use crate::repositories::InstallationRepository;
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub installations: InstallationRepository,
    pub queue: DbJobQueue,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, db: DatabaseConnection) -> Self {
        let queue = DbJobQueue::new(db.clone(), config.queue.retry_backoff_ms);
        Self {
            installations: InstallationRepository::new(db.clone()),
            queue,
            db,
            config,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/tenants/{tenant_id}/installations/{installation_id}",
            get(handlers::installations::get_installation),
        )
        .route(
            "/tenants/{tenant_id}/installations/{installation_id}/sync",
            post(handlers::installations::start_sync),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(telemetry::trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` fires
pub async fn run_server(
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::installations::get_installation,
        crate::handlers::installations::start_sync,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::installations::InstallationStatusResponse,
            crate::handlers::installations::RepositoryProgressView,
            crate::handlers::installations::TaskProgressView,
            crate::handlers::installations::SyncRequest,
            crate::handlers::installations::SyncAcceptedResponse,
            crate::progress::SyncStatus,
            crate::progress::TaskStatus,
            crate::queue::SyncType,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "installations", description = "Installation sync progress and triggers")
    ),
    info(
        title = "repo-sync API",
        description = "Incremental sync of source-host installations into a destination service",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
