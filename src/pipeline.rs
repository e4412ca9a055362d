// src/pipeline.rs
//
// Orchestrates the per-frame cycle: pull from the stream engine, decimate,
// detect, check compliance, publish, heartbeat. Single consumer; detection
// and compliance for a frame complete before the next frame is pulled.

use crate::compliance::{self, CooldownTracker};
use crate::detector::Detect;
use crate::publisher::{Delivery, Publish};
use crate::stream::StreamReader;
use crate::types::{Alert, ComplianceResult, Config, Detection};
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Connecting,
    Running,
    /// Stream lost; reconnecting indefinitely. Non-fatal.
    Degraded,
    Stopping,
    Stopped,
}

impl PipelineState {
    /// Status string on the wire. Degraded reports as ERROR so dashboards
    /// notice without the process dying.
    fn as_status(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Running => "RUNNING",
            Self::Degraded => "ERROR",
            Self::Stopping | Self::Stopped => "STOPPED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub frames_pulled: Arc<AtomicU64>,
    pub frames_processed: Arc<AtomicU64>,
    pub detections: Arc<AtomicU64>,
    pub alerts_sent: Arc<AtomicU64>,
    pub publish_failures: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            frames_pulled: Arc::new(AtomicU64::new(0)),
            frames_processed: Arc::new(AtomicU64::new(0)),
            detections: Arc::new(AtomicU64::new(0)),
            alerts_sent: Arc::new(AtomicU64::new(0)),
            publish_failures: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

pub struct Pipeline {
    config: Config,
    stream: StreamReader,
    detector: Box<dyn Detect>,
    publisher: Box<dyn Publish>,
    shutdown: Arc<AtomicBool>,
    cooldowns: CooldownTracker,
    stats: PipelineStats,
    state: PipelineState,
    qos: Delivery,
}

impl Pipeline {
    pub fn new(
        config: Config,
        stream: StreamReader,
        detector: Box<dyn Detect>,
        publisher: Box<dyn Publish>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let qos = Delivery::from_level(config.mqtt.qos);
        Self {
            config,
            stream,
            detector,
            publisher,
            shutdown,
            cooldowns: CooldownTracker::new(),
            stats: PipelineStats::new(),
            state: PipelineState::Idle,
            qos,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Run until the shutdown flag is set. A failed initial connect is a
    /// startup failure; everything after that keeps retrying indefinitely.
    pub fn run(&mut self) -> Result<()> {
        self.state = PipelineState::Connecting;
        if let Err(e) = self.stream.connect() {
            self.publish_status("ERROR", Some(&format!("stream connection failed: {e:#}")));
            return Err(e.context("Initial stream connection failed"));
        }

        self.state = PipelineState::Running;
        self.publish_status(self.state.as_status(), None);
        info!("PPE detection loop started");

        let read_timeout = Duration::from_millis(self.config.stream.read_timeout_ms);
        let reconnect_delay = Duration::from_secs(self.config.stream.reconnect_delay_secs);
        let process_interval =
            Duration::from_secs_f64(self.config.processing.process_interval_secs);

        let mut frame_count: u64 = 0;
        let mut last_process: Option<Instant> = None;

        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(frame) = self.stream.read_frame(read_timeout) else {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                warn!("No frame available, attempting reconnection");
                if self.state != PipelineState::Degraded {
                    self.state = PipelineState::Degraded;
                    self.publish_status(self.state.as_status(), Some("stream read failure"));
                }
                self.sleep_interruptible(reconnect_delay);
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match self.stream.reconnect() {
                    Ok(()) => {
                        info!("Stream reconnected");
                        self.state = PipelineState::Running;
                        self.publish_status(self.state.as_status(), None);
                    }
                    Err(e) => warn!("Reconnect failed: {:#}", e),
                }
                continue;
            };

            frame_count += 1;
            self.stats.frames_pulled.fetch_add(1, Ordering::Relaxed);

            // Frame-skip decimation.
            if frame_count % self.config.processing.skip_frames != 0 {
                continue;
            }

            // Rate limit independent of the source frame rate.
            if let Some(last) = last_process {
                if last.elapsed() < process_interval {
                    continue;
                }
            }
            last_process = Some(Instant::now());

            self.process_frame(&frame);
        }

        self.state = PipelineState::Stopping;
        info!("Shutting down pipeline");
        self.stream.release();
        self.publish_status("STOPPED", None);
        self.state = PipelineState::Stopped;
        Ok(())
    }

    /// Detection, compliance and publication for one sampled frame.
    fn process_frame(&mut self, frame: &crate::types::Frame) {
        let detections = match self.detector.detect(frame) {
            Ok(detections) => detections,
            Err(e) => {
                // Decode anomalies degrade to an empty scene for this frame.
                warn!("Detection failed on frame {}: {:#}", frame.seq, e);
                Vec::new()
            }
        };

        self.stats.frames_processed.fetch_add(1, Ordering::Relaxed);

        let result = compliance::check_compliance(&detections, &self.config.alerts.required_ppe);

        if !detections.is_empty() {
            self.stats
                .detections
                .fetch_add(detections.len() as u64, Ordering::Relaxed);
            let payload = self.detection_payload(frame, &detections, &result);
            self.publish(&self.config.mqtt.detection_topic.clone(), payload);
        }

        let alerts = compliance::generate_alerts(
            &detections,
            &result,
            &mut self.cooldowns,
            Duration::from_secs(self.config.alerts.cooldown_secs),
            Instant::now(),
        );
        for alert in &alerts {
            warn!("ALERT: {}", alert.message);
            let payload = self.alert_payload(alert);
            self.publish(&self.config.mqtt.alert_topic.clone(), payload);
            self.stats.alerts_sent.fetch_add(1, Ordering::Relaxed);
        }

        let processed = self.stats.frames_processed.load(Ordering::Relaxed);
        if processed % self.config.processing.status_every == 0 {
            self.publish_status(self.state.as_status(), None);
        }
    }

    fn publish(&self, topic: &str, payload: Value) {
        if let Err(e) = self.publisher.publish(topic, &payload, self.qos) {
            self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!("Publish to {} failed: {:#}", topic, e);
        }
    }

    fn publish_status(&self, status: &str, error: Option<&str>) {
        let mut payload = json!({
            "timestamp": now_rfc3339(),
            "device_id": self.config.device_id,
            "status": status,
            "stats": {
                "frames_processed": self.stats.frames_processed.load(Ordering::Relaxed),
                "detections": self.stats.detections.load(Ordering::Relaxed),
                "alerts_sent": self.stats.alerts_sent.load(Ordering::Relaxed),
                "publish_failures": self.stats.publish_failures.load(Ordering::Relaxed),
                "uptime_seconds": self.stats.uptime_seconds(),
                "stream_state": self.stream.state().as_str(),
                "stream": self.stream.stats(),
            },
        });
        if let Some(message) = error {
            payload["error"] = json!(message);
        }
        self.publish(&self.config.mqtt.status_topic.clone(), payload);
    }

    fn detection_payload(
        &self,
        frame: &crate::types::Frame,
        detections: &[Detection],
        result: &ComplianceResult,
    ) -> Value {
        let items: Vec<Value> = detections
            .iter()
            .map(|d| {
                json!({
                    "class": d.class_name,
                    "class_id": d.class_id,
                    "confidence": d.confidence,
                    "bbox": d.bbox.as_xyxy(),
                })
            })
            .collect();
        json!({
            "timestamp": now_rfc3339(),
            "device_id": self.config.device_id,
            "frame": {
                "seq": frame.seq,
                "timestamp_ms": frame.timestamp_ms,
            },
            "detections": items,
            "count": detections.len(),
            "compliance": result,
        })
    }

    fn alert_payload(&self, alert: &Alert) -> Value {
        json!({
            "timestamp": now_rfc3339(),
            "device_id": self.config.device_id,
            "alert_type": alert.alert_type,
            "missing_ppe": alert.class_name,
            "message": alert.message,
            "severity": "HIGH",
            "confidence": alert.confidence,
            "location": { "bbox": alert.person_bbox.as_xyxy() },
        })
    }

    /// Sleep in small slices so shutdown stays responsive during the
    /// reconnect delay.
    fn sleep_interruptible(&self, total: Duration) {
        let slice = Duration::from_millis(100);
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(slice.min(deadline - Instant::now()));
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess;
    use crate::preprocessing::Letterbox;
    use crate::publisher::recording::RecordingPublisher;
    use crate::stream::{open_source, StreamReader};
    use crate::types::{Frame, StreamConfig};

    /// Detector that decodes a fixed raw tensor through the real decode
    /// path, standing in for the model runtime.
    struct TensorDetector {
        tensor: Vec<f32>,
        shape: Vec<usize>,
    }

    impl TensorDetector {
        /// Encode (cx, cy, w, h, class, score) rows for a 640x640 frame,
        /// where the letterbox transform is the identity.
        fn new(boxes: &[(f32, f32, f32, f32, usize, f32)]) -> Self {
            let (tensor, shape) = postprocess::tests::synthetic_tensor(boxes, 8);
            Self { tensor, shape }
        }
    }

    impl Detect for TensorDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            let lb = Letterbox::compute(frame.width, frame.height, 640);
            postprocess::decode(
                &self.tensor,
                &self.shape,
                lb,
                frame.width,
                frame.height,
                0.5,
                0.45,
                &crate::types::default_class_names(),
            )
        }
    }

    struct FailingDetector;

    impl Detect for FailingDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            anyhow::bail!("malformed tensor")
        }
    }

    struct FailingPublisher;

    impl Publish for FailingPublisher {
        fn publish(&self, _topic: &str, _payload: &Value, _qos: Delivery) -> Result<()> {
            anyhow::bail!("broker unavailable")
        }
    }

    fn stub_config() -> Config {
        let mut config: Config = serde_yaml::from_str("{}").unwrap();
        config.stream = StreamConfig {
            url: "stub://camera".to_string(),
            connect_timeout_secs: 1,
            reconnect_delay_secs: 0,
            buffer_size: 2,
            read_timeout_ms: 200,
            resize: Some([64, 48]),
        };
        config.processing.skip_frames = 1;
        config.processing.process_interval_secs = 0.0;
        config.processing.status_every = 1000;
        config
    }

    fn frame_640() -> Frame {
        Frame {
            data: vec![0u8; 640 * 640 * 3],
            width: 640,
            height: 640,
            seq: 1,
            timestamp_ms: 0.0,
        }
    }

    fn pipeline_with(
        config: Config,
        detector: Box<dyn Detect>,
        publisher: Box<dyn Publish>,
    ) -> Pipeline {
        let source = open_source(&config.stream).unwrap();
        let stream = StreamReader::new(source, &config.stream);
        Pipeline::new(
            config,
            stream,
            detector,
            publisher,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn compliant_scene_publishes_detections_but_no_alerts() {
        let recorder = RecordingPublisher::new();
        // One person with a hardhat and vest well inside the person box.
        let detector = TensorDetector::new(&[
            (300.0, 300.0, 200.0, 400.0, 0, 0.9),
            (300.0, 140.0, 80.0, 50.0, 1, 0.8),
            (300.0, 320.0, 120.0, 150.0, 3, 0.8),
        ]);
        let mut pipeline = pipeline_with(
            stub_config(),
            Box::new(detector),
            Box::new(recorder.clone()),
        );

        pipeline.process_frame(&frame_640());

        let detections = recorder.on_topic("ppe/detections");
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].payload["count"], 3);
        assert_eq!(detections[0].payload["frame"]["seq"], 1);
        assert_eq!(detections[0].payload["compliance"]["compliant"], true);
        assert!(recorder.on_topic("ppe/alerts").is_empty());
    }

    #[test]
    fn missing_hardhat_alerts_once_then_respects_cooldown() {
        let recorder = RecordingPublisher::new();
        // Person with a vest but no hardhat anywhere.
        let detector = TensorDetector::new(&[
            (300.0, 300.0, 200.0, 400.0, 0, 0.9),
            (300.0, 320.0, 120.0, 150.0, 3, 0.8),
        ]);
        let mut pipeline = pipeline_with(
            stub_config(),
            Box::new(detector),
            Box::new(recorder.clone()),
        );

        pipeline.process_frame(&frame_640());
        pipeline.process_frame(&frame_640());

        let alerts = recorder.on_topic("ppe/alerts");
        assert_eq!(alerts.len(), 1, "cooldown must suppress the second alert");
        assert_eq!(alerts[0].payload["missing_ppe"], "hardhat");
        assert_eq!(alerts[0].payload["alert_type"], "missing_ppe");
        assert_eq!(alerts[0].payload["severity"], "HIGH");
        assert_eq!(
            pipeline.stats().alerts_sent.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn detector_failure_degrades_to_empty_scene() {
        let recorder = RecordingPublisher::new();
        let mut pipeline = pipeline_with(
            stub_config(),
            Box::new(FailingDetector),
            Box::new(recorder.clone()),
        );

        pipeline.process_frame(&frame_640());

        assert!(recorder.on_topic("ppe/detections").is_empty());
        assert!(recorder.on_topic("ppe/alerts").is_empty());
        assert_eq!(
            pipeline.stats().frames_processed.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn publish_failures_are_counted_not_fatal() {
        let detector = TensorDetector::new(&[(300.0, 300.0, 200.0, 400.0, 0, 0.9)]);
        let mut pipeline = pipeline_with(
            stub_config(),
            Box::new(detector),
            Box::new(FailingPublisher),
        );

        pipeline.process_frame(&frame_640());

        // Detections payload and one alert both failed to publish.
        assert!(pipeline.stats().publish_failures.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn status_heartbeat_every_processed_frame() {
        let recorder = RecordingPublisher::new();
        let mut config = stub_config();
        config.processing.status_every = 1;
        let mut pipeline = pipeline_with(
            config,
            Box::new(TensorDetector::new(&[])),
            Box::new(recorder.clone()),
        );

        pipeline.process_frame(&frame_640());
        pipeline.process_frame(&frame_640());

        let statuses = recorder.on_topic("ppe/status");
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].payload["status"], "IDLE");
        assert_eq!(statuses[0].payload["stats"]["frames_processed"], 1);
        // The reader was never connected in this test.
        assert_eq!(statuses[0].payload["stats"]["stream_state"], "disconnected");
    }

    #[test]
    fn run_with_stub_stream_stops_cleanly() {
        let recorder = RecordingPublisher::new();
        let config = stub_config();
        let shutdown = Arc::new(AtomicBool::new(false));

        let source = open_source(&config.stream).unwrap();
        let stream = StreamReader::new(source, &config.stream);
        let mut pipeline = Pipeline::new(
            config,
            stream,
            Box::new(TensorDetector::new(&[])),
            Box::new(recorder.clone()),
            Arc::clone(&shutdown),
        );

        let stopper = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            stopper.store(true, Ordering::SeqCst);
        });

        pipeline.run().unwrap();
        handle.join().unwrap();

        assert_eq!(pipeline.state(), PipelineState::Stopped);
        let statuses = recorder.on_topic("ppe/status");
        assert!(statuses.len() >= 2);
        assert_eq!(statuses.first().unwrap().payload["status"], "RUNNING");
        assert_eq!(statuses.last().unwrap().payload["status"], "STOPPED");
        assert!(
            pipeline.stats().frames_processed.load(Ordering::Relaxed) > 0,
            "stub stream frames should have been processed"
        );
    }
}
