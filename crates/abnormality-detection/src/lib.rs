//! Brain-CT abnormality detection via ONNX Runtime
//!
//! Runs a two-class UNet segmentation model over preprocessed CT slices and
//! reduces the per-pixel class probabilities to a per-image diagnosis. The
//! inference backend is selected at construction time: either a real ONNX
//! session loaded from weights on disk, or a mock that returns a fixed benign
//! diagnosis tagged as synthetic so downstream consumers can tell the two
//! apart.
//!
//! # Example
//!
//! ```no_run
//! use dicom_ct_abnormality_detection::{AbnormalityDetector, DetectionConfig};
//! use ndarray::Array2;
//!
//! # fn main() -> Result<(), dicom_ct_abnormality_detection::DetectionError> {
//! let mut detector = AbnormalityDetector::load_or_mock(
//!     "models/brain_ct_model.onnx".as_ref(),
//!     DetectionConfig::default(),
//! );
//!
//! let slice = Array2::<f32>::zeros((512, 512)).into_dyn();
//! let tensor = detector.preprocess(&slice)?;
//! let diagnosis = detector.infer(&tensor)?;
//! println!("abnormalities: {:?}", diagnosis.abnormalities);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use image::imageops::FilterType;
use image::{ImageBuffer, Luma};
use ndarray::{s, Array2, Array4, ArrayD, ArrayView2, Ix2};
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use dicom_ct_common::{DiagnosisFindings, DiagnosisResult, ProcessingError};

/// Class label reported when no abnormality crosses the threshold.
pub const NORMAL_LABEL: &str = "normal";

/// Class label reported when the abnormal-class probability crosses the
/// threshold anywhere in the image.
pub const ABNORMAL_LABEL: &str = "abnormal";

/// Errors that can occur during model loading or inference.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::Error),
}

impl From<DetectionError> for ProcessingError {
    fn from(err: DetectionError) -> Self {
        match err {
            DetectionError::ModelLoad(message) => ProcessingError::ModelLoad(message),
            other => ProcessingError::Inference(other.to_string()),
        }
    }
}

/// Configuration for the abnormality detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Spatial size the model was trained at; slices are resized to
    /// `input_size` x `input_size` before inference.
    pub input_size: u32,
    /// Abnormal-class pixel probability above which the image is flagged.
    pub abnormal_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            input_size: 256,
            abnormal_threshold: 0.5,
        }
    }
}

impl DetectionConfig {
    /// Configuration that only flags high-confidence abnormal pixels.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            abnormal_threshold: 0.75,
            ..Self::default()
        }
    }
}

enum Backend {
    Onnx(Session),
    Mock,
}

/// Two-class abnormality detector over single-channel CT slices.
///
/// Wraps an ONNX session when weights are available and a synthetic fallback
/// when they are not. The backend is fixed at construction; callers observe
/// which one they got through [`AbnormalityDetector::is_mock`].
pub struct AbnormalityDetector {
    backend: Backend,
    config: DetectionConfig,
}

impl AbnormalityDetector {
    /// Load the UNet weights from `model_path`.
    ///
    /// # Errors
    ///
    /// Returns [`DetectionError::ModelLoad`] when the file is missing or the
    /// ONNX session cannot be created from it.
    pub fn new(model_path: &Path, config: DetectionConfig) -> Result<Self, DetectionError> {
        info!("Loading abnormality model from: {:?}", model_path);

        let session = Session::builder()
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| DetectionError::ModelLoad(format!("{:?}: {e}", model_path)))?;

        info!("Abnormality model loaded successfully");
        Ok(Self {
            backend: Backend::Onnx(session),
            config,
        })
    }

    /// Create a detector that always produces the synthetic benign diagnosis.
    #[must_use]
    pub fn mock(config: DetectionConfig) -> Self {
        Self {
            backend: Backend::Mock,
            config,
        }
    }

    /// Load the model, or fall back to mock mode when loading fails.
    ///
    /// The failure is logged; request handling continues with synthetic
    /// diagnoses rather than refusing service.
    #[must_use]
    pub fn load_or_mock(model_path: &Path, config: DetectionConfig) -> Self {
        match Self::new(model_path, config.clone()) {
            Ok(detector) => detector,
            Err(e) => {
                warn!("Falling back to mock diagnoses: {e}");
                Self::mock(config)
            }
        }
    }

    /// Whether this detector produces synthetic diagnoses.
    #[must_use]
    pub fn is_mock(&self) -> bool {
        matches!(self.backend, Backend::Mock)
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Shape a decoded slice into the model input tensor `(1, 1, S, S)`.
    ///
    /// Accepts a 2-D image or a 3-D image with a redundant leading singleton
    /// channel. The slice is resized to the configured square size and
    /// z-score normalized; zero-variance input maps to all zeros.
    ///
    /// # Errors
    ///
    /// Returns [`DetectionError::InvalidInput`] for empty images or shapes
    /// other than `(H, W)` and `(1, H, W)`.
    pub fn preprocess(&self, image: &ArrayD<f32>) -> Result<Array4<f32>, DetectionError> {
        Self::preprocess_static(image, &self.config)
    }

    /// Static version of [`AbnormalityDetector::preprocess`] for callers that
    /// fan preprocessing out across workers without sharing the detector.
    pub fn preprocess_static(
        image: &ArrayD<f32>,
        config: &DetectionConfig,
    ) -> Result<Array4<f32>, DetectionError> {
        let view: ArrayView2<f32> = match image.ndim() {
            2 => image
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|e| DetectionError::InvalidInput(e.to_string()))?,
            3 if image.shape()[0] == 1 => image.slice(s![0, .., ..]),
            _ => {
                return Err(DetectionError::InvalidInput(format!(
                    "expected a 2-D image or a singleton 3-D image, got shape {:?}",
                    image.shape()
                )));
            }
        };

        let (rows, cols) = view.dim();
        if rows == 0 || cols == 0 {
            return Err(DetectionError::InvalidInput(format!(
                "cannot preprocess an empty image of shape {:?}",
                view.shape()
            )));
        }

        let size = config.input_size as usize;
        let resized = Self::resize_to_square(view, config.input_size);
        let normalized = Self::normalize_intensity(resized);

        let mut tensor = Array4::zeros((1, 1, size, size));
        tensor.slice_mut(s![0, 0, .., ..]).assign(&normalized);
        Ok(tensor)
    }

    /// Run the model over a single preprocessed tensor.
    ///
    /// # Errors
    ///
    /// Returns [`DetectionError::Inference`] when the session rejects the
    /// input or produces an output of unexpected shape.
    pub fn infer(&mut self, tensor: &Array4<f32>) -> Result<DiagnosisResult, DetectionError> {
        match &mut self.backend {
            Backend::Mock => Ok(Self::mock_diagnosis()),
            Backend::Onnx(session) => {
                let (dims, data) = Self::run_model(session, tensor)?;
                let mut results = Self::postprocess(&dims, &data, &self.config)?;
                if results.len() != 1 {
                    return Err(DetectionError::Inference(format!(
                        "model returned {} result(s) for a single image",
                        results.len()
                    )));
                }
                Ok(results.remove(0))
            }
        }
    }

    /// Run the model once over a batch of preprocessed tensors.
    ///
    /// The batch is stacked along the leading axis, pushed through the model
    /// in a single forward pass, and sliced back into per-image diagnoses in
    /// input order. An empty batch yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`DetectionError::InvalidInput`] when tensor shapes disagree
    /// and [`DetectionError::Inference`] for session or output-shape failures.
    pub fn infer_batch(
        &mut self,
        tensors: &[Array4<f32>],
    ) -> Result<Vec<DiagnosisResult>, DetectionError> {
        if tensors.is_empty() {
            return Ok(Vec::new());
        }

        match &mut self.backend {
            Backend::Mock => Ok(tensors.iter().map(|_| Self::mock_diagnosis()).collect()),
            Backend::Onnx(session) => {
                debug!("Running batched inference over {} image(s)", tensors.len());
                let batch = Self::stack_batch(tensors)?;
                let (dims, data) = Self::run_model(session, &batch)?;
                let results = Self::postprocess(&dims, &data, &self.config)?;
                if results.len() != tensors.len() {
                    return Err(DetectionError::Inference(format!(
                        "model returned {} result(s) for a batch of {}",
                        results.len(),
                        tensors.len()
                    )));
                }
                Ok(results)
            }
        }
    }

    fn resize_to_square(view: ArrayView2<f32>, size: u32) -> Array2<f32> {
        let (rows, cols) = view.dim();
        if rows as u32 == size && cols as u32 == size {
            return view.to_owned();
        }

        let mut buffer = ImageBuffer::<Luma<f32>, Vec<f32>>::new(cols as u32, rows as u32);
        for (r, row) in view.outer_iter().enumerate() {
            for (c, &value) in row.iter().enumerate() {
                buffer.put_pixel(c as u32, r as u32, Luma([value]));
            }
        }

        let resized = image::imageops::resize(&buffer, size, size, FilterType::Triangle);

        let side = size as usize;
        let mut out = Array2::zeros((side, side));
        for y in 0..side {
            for x in 0..side {
                out[[y, x]] = resized.get_pixel(x as u32, y as u32)[0];
            }
        }
        out
    }

    fn normalize_intensity(mut image: Array2<f32>) -> Array2<f32> {
        let count = image.len() as f32;
        let mean = image.sum() / count;
        let variance = image.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / count;
        let std = variance.sqrt();

        if std <= f32::EPSILON {
            image.fill(0.0);
            return image;
        }

        image.mapv_inplace(|v| (v - mean) / std);
        image
    }

    fn stack_batch(tensors: &[Array4<f32>]) -> Result<Array4<f32>, DetectionError> {
        let (_, channels, height, width) = tensors[0].dim();
        let mut batch = Array4::zeros((tensors.len(), channels, height, width));
        for (i, tensor) in tensors.iter().enumerate() {
            if tensor.dim() != (1, channels, height, width) {
                return Err(DetectionError::InvalidInput(format!(
                    "batch tensor {i} has shape {:?}, expected {:?}",
                    tensor.shape(),
                    (1, channels, height, width)
                )));
            }
            batch
                .slice_mut(s![i, .., .., ..])
                .assign(&tensor.slice(s![0, .., .., ..]));
        }
        Ok(batch)
    }

    fn run_model(
        session: &mut Session,
        input: &Array4<f32>,
    ) -> Result<(Vec<usize>, Vec<f32>), DetectionError> {
        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectionError::Inference(format!("Failed to extract tensor: {e}")))?;

        let dims: Vec<usize> = shape.as_ref().iter().map(|&d| d as usize).collect();
        Ok((dims, data.to_vec()))
    }

    /// Reduce raw logits of shape `(N, 2, H, W)` to per-image diagnoses.
    ///
    /// Applies a per-pixel softmax over the class axis, then summarizes each
    /// image: mean class probabilities become confidence scores, and the
    /// image is flagged abnormal when any pixel's abnormal-class probability
    /// exceeds the configured threshold.
    fn postprocess(
        dims: &[usize],
        data: &[f32],
        config: &DetectionConfig,
    ) -> Result<Vec<DiagnosisResult>, DetectionError> {
        if dims.len() != 4 || dims[1] != 2 {
            return Err(DetectionError::Inference(format!(
                "expected model output of shape (N, 2, H, W), got {dims:?}"
            )));
        }

        let (batch, height, width) = (dims[0], dims[2], dims[3]);
        let plane = height * width;
        if plane == 0 || data.len() != batch * 2 * plane {
            return Err(DetectionError::Inference(format!(
                "model output has {} value(s), expected {} for shape {dims:?}",
                data.len(),
                batch * 2 * plane
            )));
        }

        let mut results = Vec::with_capacity(batch);
        for n in 0..batch {
            let base = n * 2 * plane;

            let mut normal_sum = 0.0_f64;
            let mut abnormal_sum = 0.0_f64;
            let mut abnormal_max = f32::MIN;
            let mut global_max = f32::MIN;

            for p in 0..plane {
                let normal_logit = data[base + p];
                let abnormal_logit = data[base + plane + p];

                let peak = normal_logit.max(abnormal_logit);
                let normal_exp = (normal_logit - peak).exp();
                let abnormal_exp = (abnormal_logit - peak).exp();
                let total = normal_exp + abnormal_exp;

                let normal_prob = normal_exp / total;
                let abnormal_prob = abnormal_exp / total;

                normal_sum += f64::from(normal_prob);
                abnormal_sum += f64::from(abnormal_prob);
                abnormal_max = abnormal_max.max(abnormal_prob);
                global_max = global_max.max(normal_prob.max(abnormal_prob));
            }

            let pixels = plane as f64;
            let mut confidence_scores = BTreeMap::new();
            confidence_scores.insert(NORMAL_LABEL.to_string(), normal_sum / pixels);
            confidence_scores.insert(ABNORMAL_LABEL.to_string(), abnormal_sum / pixels);

            let abnormalities = if abnormal_max > config.abnormal_threshold {
                vec![ABNORMAL_LABEL.to_string()]
            } else {
                vec![NORMAL_LABEL.to_string()]
            };

            results.push(DiagnosisResult {
                abnormalities,
                confidence_scores,
                findings: DiagnosisFindings::Inference {
                    max_probability: f64::from(global_max),
                    mean_probability: (normal_sum + abnormal_sum) / (2.0 * pixels),
                    output_shape: vec![1, 2, height, width],
                },
                timestamp: Utc::now(),
            });
        }

        Ok(results)
    }

    fn mock_diagnosis() -> DiagnosisResult {
        let mut confidence_scores = BTreeMap::new();
        confidence_scores.insert(NORMAL_LABEL.to_string(), 0.85);
        confidence_scores.insert(ABNORMAL_LABEL.to_string(), 0.15);

        DiagnosisResult {
            abnormalities: vec![NORMAL_LABEL.to_string()],
            confidence_scores,
            findings: DiagnosisFindings::Synthetic {
                note: "Mock diagnosis; model weights not loaded".to_string(),
            },
            timestamp: Utc::now(),
        }
    }
}
