//! API Server Binary Entry Point

use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dicom_ct_abnormality_detection::{AbnormalityDetector, DetectionConfig};
use dicom_ct_api_server::{start_server, ApiState};
use dicom_ct_orchestrator::{PipelineConfig, ReportPipeline};
use dicom_ct_report::{ReportComposer, ReportConfig};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dicom_ct=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = env_or("CT_REPORT_ADDR", "0.0.0.0:8000");
    let model_path = PathBuf::from(env_or("CT_REPORT_MODEL_PATH", "models/brain_ct_model.onnx"));

    // Fall back to the synthetic detector when weights are absent so the
    // service still serves requests on a fresh checkout.
    let detector = AbnormalityDetector::load_or_mock(&model_path, DetectionConfig::default());

    let mut report_config = ReportConfig::default();
    if let Ok(url) = std::env::var("CT_REPORT_GENERATION_URL") {
        report_config.base_url = url;
    }
    if let Ok(model) = std::env::var("CT_REPORT_GENERATION_MODEL") {
        report_config.model = model;
    }
    if let Some(secs) = env_parse::<u64>("CT_REPORT_GENERATION_TIMEOUT_SECS") {
        report_config.generation_timeout = Duration::from_secs(secs);
    }
    let composer = ReportComposer::new(report_config);

    let mut pipeline_config = PipelineConfig::default();
    if let Some(workers) = env_parse::<usize>("CT_REPORT_WORKERS") {
        pipeline_config.worker_count = workers.max(1);
    }
    if let Some(batch) = env_parse::<usize>("CT_REPORT_BATCH_SIZE") {
        pipeline_config.batch_size = batch.max(1);
    }

    let pipeline = ReportPipeline::new(detector, composer, pipeline_config);
    let state = ApiState::new(pipeline);

    tracing::info!("Starting CT Report Generation API Server");
    start_server(&addr, state).await?;

    Ok(())
}
