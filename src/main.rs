// src/main.rs
//
// One blocking pipeline per configured camera, all feeding a single async
// consumer that writes clips to disk, submits incident records and dumps
// pair feature vectors.
//
//   camera pipelines (spawn_blocking) ──mpsc──▶ consumer task ──▶ ClipWriter / IncidentApiClient / features.jsonl

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use traffic_incident::analysis::PairFeatures;
use traffic_incident::api_client::IncidentApiClient;
use traffic_incident::clip::FinalizedClip;
use traffic_incident::clip_writer::ClipWriter;
use traffic_incident::detector::Detector;
use traffic_incident::incident_report::IncidentRecord;
use traffic_incident::pipeline::{
    IncidentPipeline, OutputSink, PipelineBuilder, PipelineError, PipelineEvent, StopHandle,
};
use traffic_incident::source::{FrameSource, RecordedSession};
use traffic_incident::types::{CameraConfig, Config, DetectorBackend, ReportingConfig, SourceConfig};

const OUTPUT_QUEUE: usize = 64;

enum Output {
    Clip {
        camera: Arc<CameraConfig>,
        clip: Box<FinalizedClip>,
    },
    Features(Vec<PairFeatures>),
}

/// Pipeline-side end of the output channel.
struct ChannelSink {
    camera: Arc<CameraConfig>,
    tx: mpsc::Sender<Output>,
    dump_features: bool,
}

impl OutputSink for ChannelSink {
    fn hand_off(&mut self, clip: FinalizedClip) {
        let clip_id = clip.clip_id.to_string();
        let output = Output::Clip {
            camera: Arc::clone(&self.camera),
            clip: Box::new(clip),
        };
        if self.tx.blocking_send(output).is_err() {
            error!("Output consumer gone, clip {} lost", clip_id);
        }
    }

    fn features(&mut self, frame_index: u64, features: &[PairFeatures]) {
        if self.dump_features && self.tx.blocking_send(Output::Features(features.to_vec())).is_err() {
            error!(
                "Output consumer gone, {} feature vector(s) from frame {} lost",
                features.len(),
                frame_index
            );
        }
    }

    fn event(&mut self, event: &PipelineEvent) {
        if let PipelineEvent::IncidentConfirmed { incident, .. } = event {
            info!("🚨 [{}] {}", self.camera.id, incident.describe());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("INCIDENT_CONFIG").ok())
        .unwrap_or_else(|| "config.yaml".to_string());
    let mut config = Config::load(&config_path)?;
    if let Ok(url) = std::env::var("INCIDENT_API_URL") {
        config.reporting.api_url = Some(url);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚗 Traffic Incident Detection Starting");
    info!("✓ Configuration loaded from {}", config_path);

    let detector = load_detector(&config)?;

    // Every pipeline is built before any frame is read, so a camera with
    // no detector or no source stops the process up front.
    let stop = StopHandle::default();
    let mut pipelines = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        let pipeline = build_pipeline(camera, &config, detector.clone(), stop.clone())
            .with_context(|| format!("Camera {} failed to start", camera.id))?;
        pipelines.push(pipeline);
    }
    info!("✓ {} camera pipeline(s) ready", pipelines.len());

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, finalizing open recordings");
                stop.stop();
            }
        });
    }

    let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
    let consumer = tokio::spawn(consume(rx, config.reporting.clone()));

    let mut handles = Vec::with_capacity(pipelines.len());
    for mut pipeline in pipelines {
        let camera = Arc::new(pipeline.camera().clone());
        let mut sink = ChannelSink {
            camera: Arc::clone(&camera),
            tx: tx.clone(),
            dump_features: config.reporting.features_path.is_some(),
        };
        let span = info_span!("camera", id = %camera.id);
        handles.push(tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            let summary = pipeline.run(&mut sink);
            (camera.id.clone(), summary)
        }));
    }
    drop(tx);

    for handle in handles {
        match handle.await {
            Ok((camera_id, summary)) => match serde_json::to_string(&summary) {
                Ok(json) => info!("[{}] Session summary: {}", camera_id, json),
                Err(e) => warn!("[{}] Could not serialize summary: {}", camera_id, e),
            },
            Err(e) => error!("Camera pipeline panicked: {}", e),
        }
    }

    let report = consumer.await.context("Output consumer panicked")?;
    info!(
        "✓ Done: {} clip(s) written, {} write failure(s), {} record(s) submitted, {} submission failure(s)",
        report.clips_written, report.write_failures, report.submitted, report.submit_failures
    );
    Ok(())
}

// ============================================================================
// PIPELINE ASSEMBLY
// ============================================================================

/// The model is loaded once and shared read-only by every camera.
fn load_detector(config: &Config) -> Result<Option<Arc<dyn Detector>>> {
    match &config.detector.backend {
        DetectorBackend::Recorded => Ok(None),
        DetectorBackend::Yolo {
            model_path,
            confidence,
        } => load_yolo(model_path, *confidence),
    }
}

#[cfg(feature = "yolo")]
fn load_yolo(model_path: &str, confidence: f32) -> Result<Option<Arc<dyn Detector>>> {
    let detector = traffic_incident::yolo::YoloDetector::new(model_path, confidence)
        .with_context(|| format!("Failed to load YOLO model {}", model_path))?;
    Ok(Some(Arc::new(detector)))
}

#[cfg(not(feature = "yolo"))]
fn load_yolo(model_path: &str, _confidence: f32) -> Result<Option<Arc<dyn Detector>>> {
    warn!(
        "YOLO backend requested ({}) but this build lacks the `yolo` feature",
        model_path
    );
    Ok(None)
}

fn build_pipeline(
    camera: &CameraConfig,
    config: &Config,
    shared_detector: Option<Arc<dyn Detector>>,
    stop: StopHandle,
) -> Result<IncidentPipeline, PipelineError> {
    let mut builder = PipelineBuilder::new(camera.clone())
        .tracker(config.tracker.clone())
        .incident(config.incident.clone())
        .recorder(config.recorder.clone())
        .source_retry(config.source_retry.clone())
        .stop_handle(stop);

    match (&camera.source, &config.detector.backend) {
        (SourceConfig::Replay { path }, DetectorBackend::Recorded) => {
            let session = RecordedSession::load_path(path, camera.fps)
                .map_err(|e| PipelineError::SourceUnavailable(format!("{:#}", e)))?;
            let (source, detector) = session.split(camera.frame_width, camera.frame_height);
            builder = builder.source(Box::new(source)).detector(Arc::new(detector));
        }
        (SourceConfig::Replay { path }, DetectorBackend::Yolo { .. }) => {
            return Err(PipelineError::InvalidConfig(format!(
                "camera {}: replayed session {} carries no imagery for a model detector",
                camera.id,
                path.display()
            )));
        }
        (SourceConfig::Video { uri }, _) => {
            builder = builder.source(video_source(uri, camera.fps)?);
            if let Some(detector) = shared_detector {
                builder = builder.detector(detector);
            }
        }
    }

    builder.build()
}

#[cfg(feature = "video")]
fn video_source(uri: &str, fps: f64) -> Result<Box<dyn FrameSource>, PipelineError> {
    Ok(Box::new(traffic_incident::video_source::VideoSource::new(uri, fps)))
}

#[cfg(not(feature = "video"))]
fn video_source(uri: &str, _fps: f64) -> Result<Box<dyn FrameSource>, PipelineError> {
    Err(PipelineError::SourceUnavailable(format!(
        "{} (this build lacks the `video` feature)",
        uri
    )))
}

// ============================================================================
// OUTPUT CONSUMER
// ============================================================================

#[derive(Debug, Default)]
struct ConsumerReport {
    clips_written: u64,
    write_failures: u64,
    submitted: u64,
    submit_failures: u64,
}

async fn consume(mut rx: mpsc::Receiver<Output>, reporting: ReportingConfig) -> ConsumerReport {
    let mut report = ConsumerReport::default();
    let writer = Arc::new(ClipWriter::new(&reporting.clip_dir));

    let api = match &reporting.api_url {
        Some(url) => match IncidentApiClient::new(url, &reporting) {
            Ok(client) => {
                info!("📡 Incident API URL: {}", client.url());
                Some(client)
            }
            Err(e) => {
                error!("Incident API disabled: {:#}", e);
                None
            }
        },
        None => None,
    };

    let mut features_file = match &reporting.features_path {
        Some(path) => match open_features(PathBuf::from(path)).await {
            Ok(file) => Some(file),
            Err(e) => {
                error!("Feature dump disabled: {:#}", e);
                None
            }
        },
        None => None,
    };

    while let Some(output) = rx.recv().await {
        match output {
            Output::Clip { camera, clip } => {
                let record = IncidentRecord::from_clip(&clip, &camera, &reporting.reporter);

                let writer = Arc::clone(&writer);
                match tokio::task::spawn_blocking(move || writer.write(&clip)).await {
                    Ok(Ok(_)) => report.clips_written += 1,
                    Ok(Err(e)) => {
                        error!("Clip write failed: {:#}", e);
                        report.write_failures += 1;
                    }
                    Err(e) => {
                        error!("Clip writer panicked: {}", e);
                        report.write_failures += 1;
                    }
                }

                if let Some(api) = &api {
                    match api.submit(&record).await {
                        Ok(_) => report.submitted += 1,
                        Err(e) => {
                            error!("Incident submission failed: {:#}", e);
                            report.submit_failures += 1;
                        }
                    }
                }
            }
            Output::Features(batch) => {
                let Some(file) = features_file.as_mut() else {
                    continue;
                };
                if let Err(e) = append_features(file, &batch).await {
                    error!("Feature dump failed, disabling: {:#}", e);
                    features_file = None;
                }
            }
        }
    }

    if let Some(mut file) = features_file {
        if let Err(e) = file.flush().await {
            warn!("Feature dump flush failed: {}", e);
        }
    }
    report
}

async fn open_features(path: PathBuf) -> Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open feature dump {}", path.display()))
}

async fn append_features(file: &mut tokio::fs::File, batch: &[PairFeatures]) -> Result<()> {
    let mut buf = String::new();
    for features in batch {
        buf.push_str(&serde_json::to_string(features).context("Failed to serialize features")?);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes()).await?;
    debug!("Dumped {} feature vector(s)", batch.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(dump_features: bool) -> (ChannelSink, mpsc::Receiver<Output>) {
        let (tx, rx) = mpsc::channel(4);
        let sink = ChannelSink {
            camera: Arc::new(CameraConfig::default()),
            tx,
            dump_features,
        };
        (sink, rx)
    }

    #[test]
    fn test_features_forwarded_only_when_dumping() {
        let (mut on, mut rx_on) = sink(true);
        on.features(7, &[]);
        assert!(matches!(rx_on.try_recv(), Ok(Output::Features(batch)) if batch.is_empty()));

        let (mut off, mut rx_off) = sink(false);
        off.features(7, &[]);
        assert!(rx_off.try_recv().is_err());
    }

    #[test]
    fn test_gone_consumer_is_reported_not_fatal() {
        let (mut sink, rx) = sink(true);
        drop(rx);
        sink.features(3, &[]);
        assert!(sink.tx.is_closed());
    }
}
