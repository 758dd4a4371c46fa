//! HTTP request handlers for API endpoints

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    types::{HealthResponse, ReportResponse},
    ApiState,
};
use dicom_ct_common::RawUpload;
use dicom_ct_ingestion::{classify_upload, UploadKind};
use dicom_ct_orchestrator::PipelineFailure;

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Generate a clinical report from uploaded DICOM files
///
/// Accepts multipart form data where each part is one file: a DICOM slice
/// or a ZIP archive of slices. Exactly one non-archive upload runs the
/// single-file flow; everything else runs the series pipeline.
pub async fn create_report(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let request_id = Uuid::new_v4().to_string();

    let mut uploads: Vec<RawUpload> = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("Malformed multipart body: {e}"),
        )
    })? {
        let filename = field.file_name().map(ToString::to_string);
        let bytes = field.bytes().await.map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                format!("Failed to read uploaded file: {e}"),
            )
        })?;
        uploads.push(RawUpload::new(filename, bytes.to_vec()));
    }

    if uploads.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "No DICOM files provided".to_string(),
        ));
    }

    info!(
        "Report request {}: {} file(s) uploaded",
        request_id,
        uploads.len()
    );

    let single_direct = uploads.len() == 1
        && classify_upload(uploads[0].filename.as_deref()) == UploadKind::Direct;
    let outcome = if single_direct {
        state.pipeline.process_single(uploads.remove(0)).await
    } else {
        state.pipeline.process_series(uploads).await
    };

    match outcome {
        Ok(outcome) => {
            info!(
                "Report request {} complete: {}/{} image(s) analyzed",
                request_id, outcome.images_processed, outcome.images_uploaded
            );
            Ok(Json(ReportResponse::from(outcome)))
        }
        Err(failure) => Err(failure_response(&request_id, &failure)),
    }
}

/// Map a pipeline failure onto an HTTP status.
///
/// Unusable input (nothing decodable, or a corrupt single file) is the
/// client's fault; anything else is a server-side failure.
fn failure_response(request_id: &str, failure: &PipelineFailure) -> (StatusCode, String) {
    let status = match failure.source.kind() {
        "aggregation_input" | "decode" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Report request {} failed: {}", request_id, failure);
    } else {
        warn!("Report request {} rejected: {}", request_id, failure);
    }
    (status, failure.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_ct_common::ProcessingError;
    use dicom_ct_orchestrator::PipelineStage;

    #[test]
    fn test_unusable_input_maps_to_bad_request() {
        let failure = PipelineFailure {
            stage: PipelineStage::Expanding,
            source: ProcessingError::AggregationInput("nothing decodable".to_string()),
        };
        let (status, body) = failure_response("req-1", &failure);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("No usable input"));
    }

    #[test]
    fn test_decode_failure_maps_to_bad_request() {
        let failure = PipelineFailure {
            stage: PipelineStage::Decoding,
            source: ProcessingError::Decode("missing pixel data".to_string()),
        };
        let (status, _) = failure_response("req-2", &failure);
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_inference_failure_maps_to_internal_error() {
        let failure = PipelineFailure {
            stage: PipelineStage::BatchInference,
            source: ProcessingError::Inference("session dropped an output".to_string()),
        };
        let (status, body) = failure_response("req-3", &failure);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("batch_inference"));
    }
}
