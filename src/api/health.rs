//! Health check endpoint.

use axum::Json;
use serde::Serialize;

/// Simple health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always "healthy" when the process is serving
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
}

/// `/health` - liveness probe for load balancers.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}
