use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Probe the gateway and report whether commands are being served.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    if let Err(err) = state.gateway_call(|gateway| gateway.health_check()).await {
        warn!(error = %err, "gateway health check failed");
    }

    let resident = state.resident_sessions().len();
    if state.is_degraded() {
        HealthResponse::degraded(resident)
    } else {
        HealthResponse::ok(resident)
    }
}
