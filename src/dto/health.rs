use serde::Serialize;
use utoipa::ToSchema;

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Sessions currently resident in memory.
    pub resident_sessions: usize,
}

impl HealthResponse {
    /// The gateway is reachable.
    pub fn ok(resident_sessions: usize) -> Self {
        Self {
            status: "ok".to_string(),
            resident_sessions,
        }
    }

    /// The gateway is unreachable; commands fail fast.
    pub fn degraded(resident_sessions: usize) -> Self {
        Self {
            status: "degraded".to_string(),
            resident_sessions,
        }
    }
}
