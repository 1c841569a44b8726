use tracing::warn;

use crate::{dao::session_store::SessionStore, dto::health::HealthResponse, state::SharedState};

/// Check the store backing the server, logging any failure.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.store().health_check().await {
        Ok(()) => HealthResponse::ok(),
        Err(err) => {
            warn!(error = %err, "storage health check failed");
            HealthResponse::degraded()
        }
    }
}
