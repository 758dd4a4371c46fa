//! Clinical report composition over an Ollama-compatible backend
//!
//! Turns an aggregated diagnosis into a structured clinical report. Prompting
//! and parsing follow a fixed four-section format (Clinical History, Findings,
//! Impression, Recommendations). When the backend cannot be reached or lacks
//! the configured model, composition falls back to a deterministic mock report
//! marked by a trailing note, so report generation never fails a request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use dicom_ct_common::{ClinicalReport, DiagnosisResult, ProcessingError};

/// Timeout for the model-availability probe against `/api/tags`.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the generation backend.
///
/// These never escape [`ReportComposer::compose`]; a failed generation is
/// downgraded to a mock report. They surface only through logs and through
/// callers that drive the lower-level methods directly.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation backend unavailable: {0}")]
    Unavailable(String),

    #[error("Model '{0}' not found on the generation backend")]
    ModelMissing(String),

    #[error("Malformed generation response: {0}")]
    Parse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<GenerationError> for ProcessingError {
    fn from(err: GenerationError) -> Self {
        ProcessingError::Generation(err.to_string())
    }
}

/// Configuration for the report composer.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Base URL of the Ollama-compatible backend.
    pub base_url: String,
    /// Model name requested for generation. The probe accepts any installed
    /// model whose name starts with this value, so `llama3` matches
    /// `llama3:latest`.
    pub model: String,
    /// Upper bound on a single generation request.
    pub generation_timeout: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            generation_timeout: Duration::from_secs(30),
        }
    }
}

/// Composes clinical reports from diagnosis results.
///
/// The composer probes the backend once on first use and remembers the
/// outcome. Once it has fallen back to mock reports it stays there for its
/// lifetime; a restart picks up a recovered backend.
pub struct ReportComposer {
    config: ReportConfig,
    client: reqwest::Client,
    initialized: AtomicBool,
    use_mock: AtomicBool,
}

impl ReportComposer {
    #[must_use]
    pub fn new(config: ReportConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            initialized: AtomicBool::new(false),
            use_mock: AtomicBool::new(false),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Whether the composer has fallen back to mock reports.
    #[must_use]
    pub fn is_mock_mode(&self) -> bool {
        self.use_mock.load(Ordering::Relaxed)
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Probe the backend for the configured model.
    ///
    /// Returns `true` when the backend is reachable and an installed model
    /// name starts with the configured one. Any failure flips the composer
    /// into mock mode.
    pub async fn ensure_model(&self) -> bool {
        if self.initialized.load(Ordering::Relaxed) {
            return true;
        }
        if self.use_mock.load(Ordering::Relaxed) {
            return false;
        }

        match self.probe_model().await {
            Ok(()) => {
                debug!("Model '{}' available at {}", self.config.model, self.base_url());
                self.initialized.store(true, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(
                    "Generation backend not ready ({e}); clinical reports will use the mock template"
                );
                self.use_mock.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    async fn probe_model(&self) -> Result<(), GenerationError> {
        let url = format!("{}/api/tags", self.base_url());
        let response = self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("{url}: {e}")))?
            .error_for_status()?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Parse(e.to_string()))?;

        let model_exists = json
            .get("models")
            .and_then(|v| v.as_array())
            .map(|models| {
                models.iter().any(|m| {
                    m.get("name")
                        .and_then(|v| v.as_str())
                        .is_some_and(|name| name.starts_with(&self.config.model))
                })
            })
            .unwrap_or(false);

        if model_exists {
            Ok(())
        } else {
            Err(GenerationError::ModelMissing(self.config.model.clone()))
        }
    }

    /// Build the generation prompt for an aggregated diagnosis.
    #[must_use]
    pub fn create_prompt(&self, diagnosis: &DiagnosisResult) -> String {
        let abnormalities = if diagnosis.abnormalities.is_empty() {
            "None detected".to_string()
        } else {
            diagnosis.abnormalities.join(", ")
        };
        let confidence = diagnosis
            .confidence_scores
            .iter()
            .map(|(label, score)| format!("{label}: {score:.2}"))
            .collect::<Vec<_>>()
            .join(", ");
        let findings = serde_json::to_string_pretty(&diagnosis.findings)
            .unwrap_or_else(|_| "{}".to_string());

        format!(
            "Based on the following CT scan analysis, generate a clinical report in the specified format.

CT Scan Analysis:
- Detected Abnormalities: {abnormalities}
- Confidence Scores: {confidence}
- Findings: {findings}

Please generate a clinical report in the following format:

Clinical History:
[Provide relevant clinical history if available]

Findings:
[Describe the findings from the CT scan analysis]

Impression:
[Provide clinical impression based on the findings]

Recommendations:
[Provide recommendations for follow-up or treatment]

Generate the report now:"
        )
    }

    /// Generate report text for a prompt, falling back to the mock template.
    ///
    /// The real backend is used when the probe succeeded and the generation
    /// request completes within the configured timeout with a well-formed
    /// response. Every failure path produces the mock report instead.
    pub async fn generate(&self, prompt: &str) -> String {
        self.ensure_model().await;

        if self.use_mock.load(Ordering::Relaxed) || !self.initialized.load(Ordering::Relaxed) {
            return self.mock_report(prompt);
        }

        match self.request_generation(prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Report generation failed ({e}); falling back to the mock template");
                self.use_mock.store(true, Ordering::Relaxed);
                self.mock_report(prompt)
            }
        }
    }

    async fn request_generation(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false
        });

        let url = format!("{}/api/generate", self.base_url());
        let response = self
            .client
            .post(&url)
            .timeout(self.config.generation_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("{url}: {e}")))?
            .error_for_status()?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Parse(e.to_string()))?;

        json.get("response")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| GenerationError::Parse("missing 'response' field".to_string()))
    }

    /// Deterministic report used when the backend is unavailable.
    ///
    /// The abnormality summary is recovered from the prompt's
    /// `Abnormalities:` line so the mock text still reflects the diagnosis.
    fn mock_report(&self, prompt: &str) -> String {
        let mut abnormalities = "normal".to_string();
        if let Some(line) = prompt.lines().find(|line| line.contains("Abnormalities:")) {
            if let Some((_, tail)) = line.split_once("Abnormalities:") {
                abnormalities = tail.trim().to_string();
            }
        }
        let abnormalities = abnormalities.to_lowercase();
        let model = &self.config.model;

        format!(
            "Clinical History:
No specific clinical history provided. Patient presented for routine CT brain imaging.

Findings:
CT brain scan analysis indicates {abnormalities} findings. The scan demonstrates normal brain parenchyma with no acute intracranial abnormalities detected. Ventricular system appears normal in size and configuration. No evidence of mass effect, hemorrhage, or acute infarction.

Impression:
Normal brain CT scan. No acute intracranial pathology identified.

Recommendations:
Routine follow-up as clinically indicated. If symptoms persist, consider clinical correlation and follow-up imaging if warranted.

Note: This is a mock report generated for PoC testing. For real LLM-generated reports, ensure Ollama is running and the model '{model}' is available."
        )
    }

    /// Split raw report text into the structured four-section form.
    ///
    /// Sections are located by their `Name:` headings, case-insensitively.
    /// A section runs until the next single-word heading or the end of the
    /// text; a heading with nothing under it yields `None`.
    #[must_use]
    pub fn format_report(&self, raw_text: &str) -> ClinicalReport {
        ClinicalReport {
            clinical_history: extract_section(raw_text, "Clinical History"),
            findings: extract_section(raw_text, "Findings"),
            impression: extract_section(raw_text, "Impression"),
            recommendations: extract_section(raw_text, "Recommendations"),
            full_text: raw_text.to_string(),
            generated_at: Utc::now(),
        }
    }

    /// Produce a structured clinical report for an aggregated diagnosis.
    pub async fn compose(&self, diagnosis: &DiagnosisResult) -> ClinicalReport {
        let prompt = self.create_prompt(diagnosis);
        let raw = self.generate(&prompt).await;
        self.format_report(&raw)
    }
}

/// Locate `section_name:` in `text` (ASCII case-insensitive) and return the
/// trimmed content up to the next `\n<word>:` heading or the end of text.
fn extract_section(text: &str, section_name: &str) -> Option<String> {
    let needle = format!("{section_name}:");
    let start = find_ascii_case_insensitive(text, &needle)? + needle.len();
    let rest = &text[start..];

    let bytes = rest.as_bytes();
    let mut end = rest.len();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b':' {
                end = i;
                break;
            }
        }
        i += 1;
    }

    let content = rest[..end].trim();
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_ct_common::DiagnosisFindings;
    use std::collections::BTreeMap;

    fn sample_diagnosis(abnormalities: &[&str]) -> DiagnosisResult {
        let mut confidence_scores = BTreeMap::new();
        confidence_scores.insert("normal".to_string(), 0.3);
        confidence_scores.insert("abnormal".to_string(), 0.7);

        DiagnosisResult {
            abnormalities: abnormalities.iter().map(ToString::to_string).collect(),
            confidence_scores,
            findings: DiagnosisFindings::Synthetic {
                note: "test".to_string(),
            },
            timestamp: Utc::now(),
        }
    }

    fn composer() -> ReportComposer {
        ReportComposer::new(ReportConfig::default())
    }

    #[test]
    fn test_prompt_includes_analysis() {
        let prompt = composer().create_prompt(&sample_diagnosis(&["abnormal"]));

        assert!(prompt.starts_with("Based on the following CT scan analysis"));
        assert!(prompt.contains("- Detected Abnormalities: abnormal"));
        assert!(prompt.contains("abnormal: 0.70"));
        assert!(prompt.contains("normal: 0.30"));
        assert!(prompt.contains("Clinical History:"));
        assert!(prompt.contains("Findings:"));
        assert!(prompt.contains("Impression:"));
        assert!(prompt.contains("Recommendations:"));
        assert!(prompt.ends_with("Generate the report now:"));
    }

    #[test]
    fn test_prompt_with_no_abnormalities() {
        let prompt = composer().create_prompt(&sample_diagnosis(&[]));
        assert!(prompt.contains("- Detected Abnormalities: None detected"));
    }

    #[test]
    fn test_mock_report_echoes_prompt_abnormalities() {
        let composer = composer();
        let prompt = composer.create_prompt(&sample_diagnosis(&["abnormal"]));
        let report = composer.mock_report(&prompt);

        assert!(report.contains("indicates abnormal findings"));
        assert!(report.contains("Note: This is a mock report"));
        assert!(report.contains("'llama3'"));
    }

    #[test]
    fn test_mock_report_defaults_to_normal() {
        let report = composer().mock_report("no analysis markers here");
        assert!(report.contains("indicates normal findings"));
    }

    #[test]
    fn test_format_report_extracts_all_sections() {
        let composer = composer();
        let raw = composer.mock_report("- Detected Abnormalities: abnormal");
        let report = composer.format_report(&raw);

        assert!(report
            .clinical_history
            .as_deref()
            .is_some_and(|s| s.starts_with("No specific clinical history")));
        assert!(report
            .findings
            .as_deref()
            .is_some_and(|s| s.contains("abnormal findings")));
        assert!(report
            .impression
            .as_deref()
            .is_some_and(|s| s.starts_with("Normal brain CT scan")));

        // The trailing note belongs to the raw text, not the sections.
        let recommendations = report.recommendations.as_deref().unwrap();
        assert!(recommendations.starts_with("Routine follow-up"));
        assert!(!recommendations.contains("Note:"));
        assert!(report.full_text.contains("Note: This is a mock report"));
        assert!(report.is_complete());
    }

    #[test]
    fn test_format_report_is_case_insensitive() {
        let report = composer().format_report("clinical history:\npatient fell\n\nFINDINGS:\nnone");
        assert_eq!(report.clinical_history.as_deref(), Some("patient fell"));
        assert_eq!(report.findings.as_deref(), Some("none"));
    }

    #[test]
    fn test_format_report_empty_section_is_none() {
        let report = composer().format_report("Findings:\nImpression:\nall clear");
        assert_eq!(report.findings, None);
        assert_eq!(report.impression.as_deref(), Some("all clear"));
        assert!(!report.is_complete());
    }

    #[test]
    fn test_extract_section_ignores_mid_line_colons() {
        let text = "Findings:\nScan acquired at 10:30 with contrast.\nSeries time: unknown\n";
        let content = extract_section(text, "Findings").unwrap();
        assert!(content.contains("10:30"));
        // "Series time:" is a two-word heading and does not terminate the
        // section, matching the single-word heading rule.
        assert!(content.contains("Series time: unknown"));
    }

    #[test]
    fn test_extract_section_missing_heading() {
        assert_eq!(extract_section("nothing relevant", "Impression"), None);
    }

    #[tokio::test]
    async fn test_unreachable_backend_yields_mock_report() {
        let composer = ReportComposer::new(ReportConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..ReportConfig::default()
        });

        let report = composer.compose(&sample_diagnosis(&["abnormal"])).await;

        assert!(composer.is_mock_mode());
        assert!(report.findings.is_some());
        assert!(report.full_text.contains("Note: This is a mock report"));
    }

    #[tokio::test]
    async fn test_ensure_model_unreachable_is_false() {
        let composer = ReportComposer::new(ReportConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..ReportConfig::default()
        });

        assert!(!composer.ensure_model().await);
        assert!(composer.is_mock_mode());
        // The verdict is remembered rather than re-probed.
        assert!(!composer.ensure_model().await);
    }
}
