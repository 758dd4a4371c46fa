//! REST API Server for CT Report Generation
//!
//! Accepts DICOM uploads over HTTP (single slices, whole series, or ZIP
//! archives) and returns an abnormality diagnosis together with a generated
//! clinical report.

mod handlers;
mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use dicom_ct_orchestrator::ReportPipeline;

pub use handlers::*;
pub use types::*;

/// API server state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// Pipeline running decode, inference, aggregation, and composition
    pub pipeline: Arc<ReportPipeline>,
}

impl ApiState {
    /// Create new API state around a configured pipeline
    #[must_use]
    pub fn new(pipeline: ReportPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Report generation from uploaded DICOM files
        .route("/api/v1/reports/from-dicom", post(create_report))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!("Starting API server on {}", addr);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_ct_abnormality_detection::{AbnormalityDetector, DetectionConfig};
    use dicom_ct_orchestrator::PipelineConfig;
    use dicom_ct_report::{ReportComposer, ReportConfig};

    #[test]
    fn test_router_builds() {
        let detector = AbnormalityDetector::mock(DetectionConfig::default());
        let composer = ReportComposer::new(ReportConfig::default());
        let pipeline = ReportPipeline::new(detector, composer, PipelineConfig::default());
        let _router = build_router(ApiState::new(pipeline));
    }
}
