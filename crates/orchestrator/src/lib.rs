//! CT Series Processing Pipeline
//!
//! Coordinates the flow from uploaded files to a clinical report: archive
//! expansion, decode and preprocessing across a bounded worker pool,
//! sequential batched inference, aggregation, and report composition.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use ndarray::Array4;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use dicom_ct_abnormality_detection::{AbnormalityDetector, DetectionConfig};
use dicom_ct_common::{
    has_dicm_magic, DecodedImage, DiagnosisFindings, DiagnosisResult, DicomMetadata, FileOutcome,
    ImageTrace, ProcessingError, RawUpload, SeriesOutcome,
};
use dicom_ct_ingestion::{classify_upload, expand_archive, UploadKind};
use dicom_ct_report::ReportComposer;

/// Upper bound on per-file failures echoed into a fatal error message.
const FAILURE_CONTEXT_LIMIT: usize = 3;

/// States a series request moves through.
///
/// Transitions are linear; any state can move to `Failed` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Expanding,
    Decoding,
    Preprocessing,
    BatchInference,
    Aggregating,
    Composing,
    Done,
    Failed(String),
}

impl PipelineStage {
    /// Stage name used in logs and failure reports.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            PipelineStage::Received => "received",
            PipelineStage::Expanding => "expanding",
            PipelineStage::Decoding => "decoding",
            PipelineStage::Preprocessing => "preprocessing",
            PipelineStage::BatchInference => "batch_inference",
            PipelineStage::Aggregating => "aggregating",
            PipelineStage::Composing => "composing",
            PipelineStage::Done => "done",
            PipelineStage::Failed(_) => "failed",
        }
    }
}

/// A fatal pipeline error carrying the stage it occurred in.
#[derive(Debug, Error)]
#[error("{} stage failed: {source}", .stage.name())]
pub struct PipelineFailure {
    pub stage: PipelineStage,
    #[source]
    pub source: ProcessingError,
}

impl From<PipelineFailure> for ProcessingError {
    fn from(failure: PipelineFailure) -> Self {
        failure.source
    }
}

/// Tuning knobs for the series pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of concurrent decode and preprocessing workers.
    pub worker_count: usize,
    /// Number of images per inference batch.
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 8,
        }
    }
}

/// One file admitted into the decode stage.
struct Candidate {
    index: usize,
    label: String,
    bytes: Vec<u8>,
}

struct DecodeRecord {
    index: usize,
    label: String,
    result: Result<(Array4<f32>, DicomMetadata), ProcessingError>,
}

/// End-to-end pipeline from raw uploads to a clinical report.
///
/// Holds the shared abnormality detector and report composer. Requests run
/// concurrently up to the decode stage; inference is serialized on the
/// detector lock so the model never sees overlapping batches.
pub struct ReportPipeline {
    detector: Arc<Mutex<AbnormalityDetector>>,
    composer: Arc<ReportComposer>,
    config: PipelineConfig,
}

impl ReportPipeline {
    #[must_use]
    pub fn new(
        detector: AbnormalityDetector,
        composer: ReportComposer,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector: Arc::new(Mutex::new(detector)),
            composer: Arc::new(composer),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the full series pipeline over a batch of uploads.
    ///
    /// Individual files that fail expansion, decoding, or preprocessing are
    /// recorded and skipped; the request fails only when nothing survives or
    /// a shared stage (inference, aggregation) breaks.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineFailure`] whose source is
    /// [`ProcessingError::AggregationInput`] when no upload yields a usable
    /// image, or the shared-stage error otherwise.
    pub async fn process_series(
        &self,
        uploads: Vec<RawUpload>,
    ) -> Result<SeriesOutcome, PipelineFailure> {
        let images_uploaded = uploads.len();
        let mut stage = PipelineStage::Received;
        info!("Received {} upload(s)", images_uploaded);

        advance(&mut stage, PipelineStage::Expanding);
        let (candidates, mut file_outcomes) = assemble_candidates(uploads);
        if candidates.is_empty() {
            let context = failure_context(&file_outcomes);
            return Err(fail(
                stage,
                ProcessingError::AggregationInput(format!(
                    "none of the {images_uploaded} uploaded file(s) produced a DICOM candidate; {context}"
                )),
            ));
        }
        let total_candidates = candidates.len();
        info!("Assembled {} decode candidate(s)", total_candidates);

        advance(&mut stage, PipelineStage::Decoding);
        let records = self.decode_and_preprocess(candidates).await;

        advance(&mut stage, PipelineStage::Preprocessing);
        let mut tensors: Vec<Array4<f32>> = Vec::with_capacity(records.len());
        let mut metadata_in_order: Vec<DicomMetadata> = Vec::with_capacity(records.len());
        for record in records {
            match record.result {
                Ok((tensor, metadata)) => {
                    file_outcomes.push(FileOutcome::success(record.index));
                    tensors.push(tensor);
                    metadata_in_order.push(metadata);
                }
                Err(e) => {
                    warn!("Candidate {} ({}) dropped: {e}", record.index, record.label);
                    file_outcomes.push(FileOutcome::failure(record.index, e.kind(), e.to_string()));
                }
            }
        }
        if tensors.is_empty() {
            let context = failure_context(&file_outcomes);
            return Err(fail(
                stage,
                ProcessingError::AggregationInput(format!(
                    "0 of {total_candidates} candidate(s) decoded successfully; {context}"
                )),
            ));
        }

        advance(&mut stage, PipelineStage::BatchInference);
        let diagnoses = match self.run_batches(&tensors).await {
            Ok(diagnoses) => diagnoses,
            Err(e) => return Err(fail(stage, e)),
        };

        advance(&mut stage, PipelineStage::Aggregating);
        let diagnosis = match aggregate(&diagnoses) {
            Ok(diagnosis) => diagnosis,
            Err(e) => return Err(fail(stage, e)),
        };

        advance(&mut stage, PipelineStage::Composing);
        let report = self.composer.compose(&diagnosis).await;

        advance(&mut stage, PipelineStage::Done);
        let images_processed = tensors.len();
        file_outcomes.sort_by_key(|outcome| outcome.index);
        let metadata = metadata_in_order.into_iter().next().unwrap_or_default();
        info!(
            "Series complete: {} of {} candidate(s) analyzed",
            images_processed, total_candidates
        );

        Ok(SeriesOutcome {
            diagnosis,
            report,
            metadata,
            images_uploaded,
            images_processed,
            file_outcomes,
        })
    }

    /// Single-file flow: decode, preprocess, infer, and compose without the
    /// series fan-out. A decode failure here fails the whole request.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineFailure`] when decoding, preprocessing, or
    /// inference fails.
    pub async fn process_single(&self, upload: RawUpload) -> Result<SeriesOutcome, PipelineFailure> {
        let mut stage = PipelineStage::Received;
        let name = upload
            .filename
            .clone()
            .unwrap_or_else(|| "upload-0".to_string());
        info!("Received single file: {}", name);

        advance(&mut stage, PipelineStage::Decoding);
        let decoded = match dicom_ct_decode::decode(&upload.bytes) {
            Ok(image) => image,
            Err(e) => return Err(fail(stage, e.into())),
        };
        let DecodedImage { metadata, pixels } = decoded;

        advance(&mut stage, PipelineStage::Preprocessing);
        let detection_config = self.detector.lock().await.config().clone();
        let tensor =
            match AbnormalityDetector::preprocess_static(&pixels.into_dyn(), &detection_config) {
                Ok(tensor) => tensor,
                Err(e) => return Err(fail(stage, e.into())),
            };

        advance(&mut stage, PipelineStage::BatchInference);
        let diagnosis = {
            let mut detector = self.detector.lock().await;
            match detector.infer(&tensor) {
                Ok(diagnosis) => diagnosis,
                Err(e) => return Err(fail(stage, e.into())),
            }
        };

        advance(&mut stage, PipelineStage::Composing);
        let report = self.composer.compose(&diagnosis).await;

        advance(&mut stage, PipelineStage::Done);
        info!("Single file complete: {}", name);

        Ok(SeriesOutcome {
            diagnosis,
            report,
            metadata,
            images_uploaded: 1,
            images_processed: 1,
            file_outcomes: vec![FileOutcome::success(0)],
        })
    }

    /// Fan decode and preprocessing out across the worker pool and collect
    /// per-candidate results in submission order.
    async fn decode_and_preprocess(&self, candidates: Vec<Candidate>) -> Vec<DecodeRecord> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let detection_config = self.detector.lock().await.config().clone();

        let mut handles = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let index = candidate.index;
            let label = candidate.label.clone();
            let semaphore = Arc::clone(&semaphore);
            let config = detection_config.clone();
            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return DecodeRecord {
                            index: candidate.index,
                            label: candidate.label,
                            result: Err(ProcessingError::Other(format!("worker pool closed: {e}"))),
                        };
                    }
                };
                debug!("Decoding candidate {} ({})", candidate.index, candidate.label);
                let result = decode_one(&candidate.bytes, &config);
                DecodeRecord {
                    index: candidate.index,
                    label: candidate.label,
                    result,
                }
            });
            handles.push((index, label, handle));
        }

        // Awaiting in spawn order keeps records in submission order even
        // though workers complete out of order.
        let mut records = Vec::with_capacity(handles.len());
        for (index, label, handle) in handles {
            match handle.await {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!("Decode worker for {} aborted: {e}", label);
                    records.push(DecodeRecord {
                        index,
                        label,
                        result: Err(ProcessingError::Other(format!("decode task aborted: {e}"))),
                    });
                }
            }
        }
        records
    }

    /// Run inference sequentially over fixed-size batches under one detector
    /// lock, keeping results in input order.
    async fn run_batches(
        &self,
        tensors: &[Array4<f32>],
    ) -> Result<Vec<DiagnosisResult>, ProcessingError> {
        let batch_size = self.config.batch_size.max(1);
        let mut detector = self.detector.lock().await;
        let mut diagnoses = Vec::with_capacity(tensors.len());
        for (batch_index, batch) in tensors.chunks(batch_size).enumerate() {
            debug!(
                "Running inference batch {} ({} image(s))",
                batch_index,
                batch.len()
            );
            diagnoses.extend(detector.infer_batch(batch)?);
        }
        Ok(diagnoses)
    }
}

/// Combine per-image diagnoses into one series-level diagnosis.
///
/// Unions abnormality labels in first-seen order, counts occurrences, and
/// averages every label's confidence over the total number of images, so a
/// label absent from an image contributes zero for that image.
///
/// # Errors
///
/// Returns [`ProcessingError::AggregationInput`] when `diagnoses` is empty.
pub fn aggregate(diagnoses: &[DiagnosisResult]) -> Result<DiagnosisResult, ProcessingError> {
    if diagnoses.is_empty() {
        return Err(ProcessingError::AggregationInput(
            "no per-image diagnoses to aggregate".to_string(),
        ));
    }

    let total = diagnoses.len();
    let mut abnormalities: Vec<String> = Vec::new();
    let mut occurrences: BTreeMap<String, usize> = BTreeMap::new();
    let mut score_sums: BTreeMap<String, f64> = BTreeMap::new();
    let mut per_image: Vec<ImageTrace> = Vec::with_capacity(total);

    for (index, diagnosis) in diagnoses.iter().enumerate() {
        for label in &diagnosis.abnormalities {
            if !abnormalities.contains(label) {
                abnormalities.push(label.clone());
            }
            *occurrences.entry(label.clone()).or_insert(0) += 1;
        }
        for (label, score) in &diagnosis.confidence_scores {
            *score_sums.entry(label.clone()).or_insert(0.0) += score;
        }
        per_image.push(ImageTrace {
            index,
            abnormalities: diagnosis.abnormalities.clone(),
            confidence_scores: diagnosis.confidence_scores.clone(),
            findings: serde_json::to_value(&diagnosis.findings).unwrap_or(serde_json::Value::Null),
        });
    }

    let confidence_scores: BTreeMap<String, f64> = score_sums
        .into_iter()
        .map(|(label, sum)| (label, sum / total as f64))
        .collect();

    Ok(DiagnosisResult {
        abnormalities,
        confidence_scores,
        findings: DiagnosisFindings::Aggregate {
            total_images_analyzed: total,
            occurrences,
            per_image,
        },
        timestamp: Utc::now(),
    })
}

/// Expand archives and sniff direct uploads into an ordered candidate list.
///
/// Direct files without the DICOM signature are dropped without a record;
/// a broken archive consumes one index and leaves a failure record.
fn assemble_candidates(uploads: Vec<RawUpload>) -> (Vec<Candidate>, Vec<FileOutcome>) {
    let mut candidates = Vec::with_capacity(uploads.len());
    let mut outcomes = Vec::new();
    let mut next_index = 0usize;

    for (upload_index, upload) in uploads.into_iter().enumerate() {
        let name = upload
            .filename
            .clone()
            .unwrap_or_else(|| format!("upload-{upload_index}"));
        match classify_upload(upload.filename.as_deref()) {
            UploadKind::Archive => match expand_archive(&upload.bytes) {
                Ok(members) => {
                    info!(
                        "Expanded archive {} into {} DICOM candidate(s)",
                        name,
                        members.len()
                    );
                    for (member_index, bytes) in members.into_iter().enumerate() {
                        candidates.push(Candidate {
                            index: next_index,
                            label: format!("{name}#{member_index}"),
                            bytes,
                        });
                        next_index += 1;
                    }
                }
                Err(e) => {
                    let err = ProcessingError::from(e);
                    warn!("Archive {} rejected: {err}", name);
                    outcomes.push(FileOutcome::failure(next_index, err.kind(), err.to_string()));
                    next_index += 1;
                }
            },
            UploadKind::Direct => {
                if has_dicm_magic(&upload.bytes) {
                    candidates.push(Candidate {
                        index: next_index,
                        label: name,
                        bytes: upload.bytes,
                    });
                    next_index += 1;
                } else {
                    debug!("Dropping {}: no DICOM signature", name);
                }
            }
        }
    }

    (candidates, outcomes)
}

fn decode_one(
    bytes: &[u8],
    config: &DetectionConfig,
) -> Result<(Array4<f32>, DicomMetadata), ProcessingError> {
    let DecodedImage { metadata, pixels } = dicom_ct_decode::decode(bytes)?;
    let tensor = AbnormalityDetector::preprocess_static(&pixels.into_dyn(), config)?;
    Ok((tensor, metadata))
}

fn advance(stage: &mut PipelineStage, next: PipelineStage) {
    debug!("Pipeline stage: {} -> {}", stage.name(), next.name());
    *stage = next;
}

fn fail(stage: PipelineStage, source: ProcessingError) -> PipelineFailure {
    let failed = PipelineStage::Failed(source.to_string());
    error!("Pipeline stage: {} -> {}: {source}", stage.name(), failed.name());
    PipelineFailure { stage, source }
}

fn failure_context(outcomes: &[FileOutcome]) -> String {
    let failures: Vec<&FileOutcome> = outcomes.iter().filter(|o| !o.succeeded).collect();
    if failures.is_empty() {
        return "no per-file failures recorded".to_string();
    }
    let start = failures.len().saturating_sub(FAILURE_CONTEXT_LIMIT);
    let shown: Vec<String> = failures[start..]
        .iter()
        .map(|outcome| {
            format!(
                "file {}: {}",
                outcome.index,
                outcome.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();
    if start > 0 {
        format!("last {} failure(s): {}", shown.len(), shown.join("; "))
    } else {
        format!("failures: {}", shown.join("; "))
    }
}
