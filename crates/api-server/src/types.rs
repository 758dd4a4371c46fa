//! API request and response types

use serde::{Deserialize, Serialize};

use dicom_ct_common::{ClinicalReport, DiagnosisResult, DicomMetadata, SeriesOutcome};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Response for a processed DICOM upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    /// Generated clinical report
    pub report: ClinicalReport,
    /// Series-level diagnosis (or the single-image diagnosis)
    pub diagnosis: DiagnosisResult,
    /// Metadata of the first successfully decoded image
    pub dicom_metadata: DicomMetadata,
    /// Number of files received in the request
    pub images_uploaded: usize,
    /// Number of images that reached inference
    pub images_processed: usize,
}

impl From<SeriesOutcome> for ReportResponse {
    fn from(outcome: SeriesOutcome) -> Self {
        Self {
            report: outcome.report,
            diagnosis: outcome.diagnosis,
            dicom_metadata: outcome.metadata,
            images_uploaded: outcome.images_uploaded,
            images_processed: outcome.images_processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dicom_ct_common::DiagnosisFindings;
    use std::collections::BTreeMap;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "1.0.0".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"version\":\"1.0.0\""));
    }

    #[test]
    fn test_report_response_serialization() {
        let mut confidence_scores = BTreeMap::new();
        confidence_scores.insert("normal".to_string(), 0.85);
        confidence_scores.insert("abnormal".to_string(), 0.15);

        let response = ReportResponse {
            report: ClinicalReport {
                clinical_history: Some("No prior history available.".to_string()),
                findings: Some("No acute abnormalities.".to_string()),
                impression: Some("Normal study.".to_string()),
                recommendations: None,
                full_text: "Findings: No acute abnormalities.".to_string(),
                generated_at: Utc::now(),
            },
            diagnosis: DiagnosisResult {
                abnormalities: vec!["normal".to_string()],
                confidence_scores,
                findings: DiagnosisFindings::Synthetic {
                    note: "test".to_string(),
                },
                timestamp: Utc::now(),
            },
            dicom_metadata: DicomMetadata::default(),
            images_uploaded: 3,
            images_processed: 2,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"images_uploaded\":3"));
        assert!(json.contains("\"images_processed\":2"));
        assert!(json.contains("\"dicom_metadata\""));

        let parsed: ReportResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.diagnosis.abnormalities, vec!["normal"]);
        assert_eq!(parsed.report.impression.as_deref(), Some("Normal study."));
    }
}
