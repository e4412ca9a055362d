use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub url: String,
    /// Open/first-read timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Delay before a reconnect attempt after losing the stream.
    pub reconnect_delay_secs: u64,
    /// Bounded frame queue capacity. Oldest frames are evicted when full.
    pub buffer_size: usize,
    /// How long the consumer blocks waiting for a frame.
    pub read_timeout_ms: u64,
    /// Optional [width, height] resize applied at acquisition time.
    pub resize: Option<[usize; 2]>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://192.168.1.100:554/stream".to_string(),
            connect_timeout_secs: 30,
            reconnect_delay_secs: 5,
            buffer_size: 2,
            read_timeout_ms: 1000,
            resize: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: String,
    /// Square model input size (e.g. 640 for YOLOv8).
    pub input_size: usize,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub num_threads: usize,
    pub class_names: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "models/ppe_yolov8n.onnx".to_string(),
            input_size: 640,
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            num_threads: 4,
            class_names: default_class_names(),
        }
    }
}

/// Class table of the PPE detection model.
pub fn default_class_names() -> Vec<String> {
    [
        "person",
        "hardhat",
        "no_hardhat",
        "safety_vest",
        "no_safety_vest",
        "safety_glasses",
        "gloves",
        "mask",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Process only every Nth frame pulled from the buffer.
    pub skip_frames: u64,
    /// Minimum wall-clock seconds between two processed frames.
    pub process_interval_secs: f64,
    /// Publish a status heartbeat every N processed frames.
    pub status_every: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            skip_frames: 5,
            process_interval_secs: 1.0,
            status_every: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum seconds between two alerts for the same PPE class.
    pub cooldown_secs: u64,
    pub required_ppe: Vec<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            required_ppe: vec!["hardhat".to_string(), "safety_vest".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// When false the pipeline logs payloads instead of publishing.
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// 0 = at most once, 1 = at least once.
    pub qos: u8,
    pub detection_topic: String,
    pub alert_topic: String,
    pub status_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 60,
            qos: 1,
            detection_topic: "ppe/detections".to_string(),
            alert_topic: "ppe/alerts".to_string(),
            status_topic: "ppe/status".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_device_id() -> String {
    "ppe-edge-01".to_string()
}

/// One decoded video frame. Owned by the frame queue until handed to the
/// consumer; never shared mutably across threads.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Interleaved RGB pixel data, row-major.
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    /// Monotonic acquisition sequence number.
    pub seq: u64,
    pub timestamp_ms: f64,
}

/// Axis-aligned box in original-image pixel coordinates, x1 < x2, y1 < y2.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Clamp both corners into [0, width] x [0, height]. A box that degrades
    /// to zero area is kept as-is; overlap checks treat it as no-overlap.
    pub fn clamped(&self, width: f32, height: f32) -> Self {
        Self {
            x1: self.x1.clamp(0.0, width),
            y1: self.y1.clamp(0.0, height),
            x2: self.x2.clamp(0.0, width),
            y2: self.y2.clamp(0.0, height),
        }
    }

    pub fn as_xyxy(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub class_id: usize,
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Stream connection state, owned exclusively by the stream engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceSummary {
    pub total_persons: usize,
    pub compliant_count: usize,
    pub violation_count: usize,
}

/// Per-frame compliance verdict. Recomputed fresh on every call, never
/// persisted across frames.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceResult {
    pub compliant: bool,
    pub persons_detected: usize,
    pub detected_ppe: Vec<String>,
    pub missing_ppe: Vec<String>,
    /// Classes the model reported explicitly as not worn (`no_*`).
    pub violations: Vec<String>,
    pub summary: ComplianceSummary,
}

/// An emitted violation. Lives only between generation and publication.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub class_name: String,
    pub alert_type: String,
    pub message: String,
    pub person_bbox: BoundingBox,
    pub confidence: f32,
}
