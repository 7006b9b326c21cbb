use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use error_stack::Report;
use poem::delete;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::post;
use poem::put;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers;
use crate::domain::engine::GovernanceEngine;

/// Set once the engine finished initialization.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// HTTP API server exposing inventory, partition state and admission
pub struct ApiServer {
    engine: Arc<GovernanceEngine>,
    readiness: Readiness,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(engine: Arc<GovernanceEngine>, readiness: Readiness, listen_addr: String) -> Self {
        Self {
            engine,
            readiness,
            listen_addr,
        }
    }

    /// Serves until cancelled.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.engine, self.readiness);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}

pub fn routes(engine: Arc<GovernanceEngine>, readiness: Readiness) -> impl Endpoint {
    Route::new()
        .at("/healthz", get(handlers::healthz))
        .at("/readyz", get(handlers::readyz))
        .at("/api/v1/units", get(handlers::list_units))
        .at("/api/v1/devices", get(handlers::list_devices))
        .at("/api/v1/devices/:node/:index/scheme", put(handlers::declare_scheme))
        .at(
            "/api/v1/devices/:node/:index/clear-fault",
            post(handlers::clear_fault),
        )
        .at(
            "/api/v1/profiles",
            get(handlers::list_profiles).put(handlers::replace_profiles),
        )
        .at("/api/v1/profiles/validate", post(handlers::validate_profile))
        .at("/api/v1/profiles/:name", delete(handlers::remove_profile))
        .at("/api/v1/quotas", put(handlers::replace_quotas))
        .at("/api/v1/workloads", post(handlers::submit_workload))
        .at(
            "/api/v1/workloads/:id",
            get(handlers::get_workload).delete(handlers::cancel_workload),
        )
        .at(
            "/api/v1/workloads/:id/complete",
            post(handlers::complete_workload),
        )
        .data(engine)
        .data(readiness)
        .with(Tracing)
}
