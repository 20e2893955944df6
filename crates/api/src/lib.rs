//! `api` crate: the HTTP surface of the run engine.
//!
//! Everything is mounted under `/api/v1`:
//!
//! ```text
//! GET    /health
//! POST   /pipelines                  GET /pipelines
//! GET    /pipelines/{id}             PUT /pipelines/{id}    DELETE /pipelines/{id}
//! POST   /pipelines/{id}/validate
//! POST   /pipelines/{id}/runs        GET /pipelines/{id}/runs
//! GET    /runs/{id}
//! POST   /runs/{id}/cancel
//! GET    /runs/{id}/events           (server-sent events)
//! GET    /events                     (server-sent events, every run)
//! POST   /webhooks/jobs              GET /webhooks/jobs
//! GET    /jobs/polling               POST /jobs/polling
//! ```

pub mod error;
pub mod handlers;

use std::future::Future;

use axum::{
    routing::{get, post},
    Router,
};
use engine::RunController;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::{ApiError, ApiResult};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: RunController,
}

impl AppState {
    pub fn new(controller: RunController) -> Self {
        Self { controller }
    }
}

/// Build the full router.
pub fn create_router(state: AppState) -> Router {
    use handlers::{events, health, pipelines, polling, runs, webhooks};

    let v1 = Router::new()
        .route("/health", get(health::health_check))
        // Pipelines
        .route("/pipelines", post(pipelines::create).get(pipelines::list))
        .route(
            "/pipelines/:id",
            get(pipelines::get)
                .put(pipelines::update)
                .delete(pipelines::delete),
        )
        .route("/pipelines/:id/validate", post(pipelines::validate))
        // Runs
        .route(
            "/pipelines/:id/runs",
            post(runs::start).get(runs::list),
        )
        .route("/runs/:id", get(runs::get))
        .route("/runs/:id/cancel", post(runs::cancel))
        // Event streams
        .route("/runs/:id/events", get(events::run_events))
        .route("/events", get(events::all_events))
        // Job board
        .route(
            "/webhooks/jobs",
            post(webhooks::receive).get(webhooks::verify),
        )
        .route("/jobs/polling", get(polling::status).post(polling::resume));

    Router::new()
        .nest("/api/v1", v1)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: &str, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "API listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
