//! Common types shared across the CT report pipeline.

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Offset of the `DICM` magic in a standard Part-10 file (after the preamble).
pub const DICM_MAGIC_OFFSET: usize = 128;

/// Minimum length of a byte stream that can carry the Part-10 signature.
pub const DICM_MIN_LEN: usize = 132;

/// Returns true when `bytes` carries the `DICM` signature at the Part-10
/// offset or at the very start (preamble-less files).
#[must_use]
pub fn has_dicm_magic(bytes: &[u8]) -> bool {
    if bytes.len() < DICM_MIN_LEN {
        return false;
    }
    &bytes[DICM_MAGIC_OFFSET..DICM_MAGIC_OFFSET + 4] == b"DICM" || &bytes[..4] == b"DICM"
}

/// Processing errors
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("No usable input: {0}")]
    AggregationInput(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ProcessingError {
    /// Stable taxonomy name, used in per-file outcome records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Decode(_) => "decode",
            ProcessingError::Archive(_) => "archive",
            ProcessingError::ModelLoad(_) => "model_load",
            ProcessingError::Inference(_) => "inference",
            ProcessingError::Generation(_) => "generation",
            ProcessingError::AggregationInput(_) => "aggregation_input",
            ProcessingError::IoError(_) => "io",
            ProcessingError::Other(_) => "other",
        }
    }
}

/// Result type for processing operations
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// One uploaded file as received at the service boundary.
#[derive(Debug, Clone)]
pub struct RawUpload {
    /// Client-supplied filename, when the transport carried one.
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

impl RawUpload {
    #[must_use]
    pub fn new(filename: Option<String>, bytes: Vec<u8>) -> Self {
        Self { filename, bytes }
    }
}

/// Identifiers and acquisition details extracted from one DICOM instance.
///
/// Missing tags map to `None`; extraction never fails on absent metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DicomMetadata {
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub study_date: Option<String>,
    pub modality: Option<String>,
    pub slice_thickness: Option<f64>,
    pub pixel_spacing: Option<f64>,
    pub rows: Option<u32>,
    pub columns: Option<u32>,
}

impl DicomMetadata {
    /// Whether the instance belongs to an identifiable study.
    #[must_use]
    pub fn has_study(&self) -> bool {
        self.study_instance_uid.is_some()
    }

    /// Image dimensions as (rows, columns) when both tags were present.
    #[must_use]
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match (self.rows, self.columns) {
            (Some(r), Some(c)) => Some((r, c)),
            _ => None,
        }
    }
}

/// One successfully parsed DICOM instance: extracted metadata plus the
/// min-max normalized pixel array (values in [0, 1]).
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub metadata: DicomMetadata,
    pub pixels: Array2<f32>,
}

/// Structured findings attached to a diagnosis.
///
/// `Inference` and `Synthetic` are per-image; `Aggregate` is produced once
/// per series. The `per_image` entries keep each image's findings as an
/// opaque value for traceability only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosisFindings {
    Inference {
        max_probability: f64,
        mean_probability: f64,
        output_shape: Vec<usize>,
    },
    Synthetic {
        note: String,
    },
    Aggregate {
        total_images_analyzed: usize,
        occurrences: BTreeMap<String, usize>,
        per_image: Vec<ImageTrace>,
    },
}

/// Per-image entry inside aggregate findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTrace {
    pub index: usize,
    pub abnormalities: Vec<String>,
    pub confidence_scores: BTreeMap<String, f64>,
    pub findings: serde_json::Value,
}

/// Output of inference for one image, or the aggregate over a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub abnormalities: Vec<String>,
    pub confidence_scores: BTreeMap<String, f64>,
    pub findings: DiagnosisFindings,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosisResult {
    /// True when this diagnosis was produced without a loaded model.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        matches!(self.findings, DiagnosisFindings::Synthetic { .. })
    }
}

/// Final structured narrative built from one aggregate diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalReport {
    pub clinical_history: Option<String>,
    pub findings: Option<String>,
    pub impression: Option<String>,
    pub recommendations: Option<String>,
    pub full_text: String,
    pub generated_at: DateTime<Utc>,
}

impl ClinicalReport {
    /// Whether all four sections were recovered from the generated text.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.clinical_history.is_some()
            && self.findings.is_some()
            && self.impression.is_some()
            && self.recommendations.is_some()
    }
}

/// Per-file success/failure record kept for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub index: usize,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileOutcome {
    #[must_use]
    pub fn success(index: usize) -> Self {
        FileOutcome {
            index,
            succeeded: true,
            error_kind: None,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(index: usize, kind: &str, message: impl Into<String>) -> Self {
        FileOutcome {
            index,
            succeeded: false,
            error_kind: Some(kind.to_string()),
            error: Some(message.into()),
        }
    }
}

/// Everything returned for one processed series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesOutcome {
    pub diagnosis: DiagnosisResult,
    pub report: ClinicalReport,
    /// Metadata of the first successfully decoded image.
    pub metadata: DicomMetadata,
    pub images_uploaded: usize,
    pub images_processed: usize,
    pub file_outcomes: Vec<FileOutcome>,
}

impl SeriesOutcome {
    /// Number of files that failed decode or preprocessing.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.file_outcomes.iter().filter(|o| !o.succeeded).count()
    }
}
