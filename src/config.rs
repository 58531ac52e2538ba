use crate::frame::{ResizeFilter, TensorSpec};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WastescanConfig {
    pub camera: CameraConfig,
    pub preprocess: PreprocessConfig,
    pub backend: BackendConfig,
    pub interpreter: InterpreterConfig,
    pub scan: ScanConfig,
    pub system: SystemConfig,
}

/// Where frames come from
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraSource {
    /// Synthetic frames, no hardware needed
    Mock,
    /// Cycle through still images in a directory
    Directory,
    /// V4L2 device through GStreamer (requires the `camera` feature)
    V4l2,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    #[serde(default = "default_camera_source")]
    pub source: CameraSource,

    /// Camera device index (e.g., 0 for /dev/video0)
    #[serde(default = "default_camera_index")]
    pub index: u32,

    /// Camera resolution (width, height)
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Video format (MJPG)
    #[serde(default = "default_camera_format")]
    pub format: String,

    /// Image directory for the `directory` source
    #[serde(default = "default_camera_directory")]
    pub directory: String,

    /// Ask the device not to fire a shutter indicator. Platform dependent.
    #[serde(default = "default_silent_capture")]
    pub silent_capture: bool,

    /// How long a single still capture may wait for the device
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PreprocessConfig {
    /// Model input width
    #[serde(default = "default_input_size")]
    pub width: u32,

    /// Model input height
    #[serde(default = "default_input_size")]
    pub height: u32,

    #[serde(default = "default_channels")]
    pub channels: u32,

    /// Divisor applied to every 8-bit channel value
    #[serde(default = "default_scale")]
    pub scale: f32,

    #[serde(default)]
    pub resize: ResizeFilter,

    /// Longest side of images uploaded to image-consuming backends
    #[serde(default = "default_upload_max_dimension")]
    pub upload_max_dimension: u32,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Remote,
    Local,
    Sandbox,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RemoteConfig {
    /// Multipart classification endpoint
    #[serde(default = "default_remote_endpoint")]
    pub endpoint: String,

    /// GET endpoint used by backend initialization
    #[serde(default = "default_remote_health_endpoint")]
    pub health_endpoint: String,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_remote_timeout")]
    pub timeout_seconds: u64,

    /// Minimum wait after an HTTP 429
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalConfig {
    /// ONNX model file
    #[serde(default = "default_model_path")]
    pub model_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SandboxConfig {
    /// Executable hosting the model runtime
    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_sandbox_ready_timeout")]
    pub ready_timeout_seconds: u64,

    #[serde(default = "default_sandbox_inference_timeout")]
    pub inference_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InterpreterConfig {
    /// Predictions below this are returned but not flagged as actionable
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanConfig {
    /// Delay between the end of one cycle and the start of the next
    #[serde(default = "default_scan_interval_ms")]
    pub interval_ms: u64,

    /// Start scanning once the backend reports ready
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,

    #[serde(default = "default_auto_start_delay_ms")]
    pub auto_start_delay_ms: u64,

    /// How long `stop` waits for an in-flight cycle before detaching it
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Consecutive failed cycles before the loop halts itself (0 = never)
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn auto_start_delay(&self) -> Duration {
        Duration::from_millis(self.auto_start_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_scan_interval_ms(),
            auto_start: default_auto_start(),
            auto_start_delay_ms: default_auto_start_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Event bus capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Lines kept by the rolling debug log
    #[serde(default = "default_debug_log_capacity")]
    pub debug_log_capacity: usize,
}

impl PreprocessConfig {
    pub fn tensor_spec(&self) -> TensorSpec {
        TensorSpec {
            width: self.width,
            height: self.height,
            channels: self.channels,
            scale: self.scale,
            resize: self.resize,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            width: default_input_size(),
            height: default_input_size(),
            channels: default_channels(),
            scale: default_scale(),
            resize: ResizeFilter::default(),
            upload_max_dimension: default_upload_max_dimension(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl WastescanConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("wastescan.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("camera.source", "mock")?
            .set_default("camera.index", default_camera_index())?
            .set_default(
                "camera.resolution",
                vec![default_camera_resolution().0, default_camera_resolution().1],
            )?
            .set_default("camera.format", default_camera_format())?
            .set_default("camera.directory", default_camera_directory())?
            .set_default("camera.silent_capture", default_silent_capture())?
            .set_default("camera.capture_timeout_ms", default_capture_timeout_ms())?
            .set_default("preprocess.width", default_input_size())?
            .set_default("preprocess.height", default_input_size())?
            .set_default("preprocess.channels", default_channels())?
            .set_default("preprocess.scale", default_scale() as f64)?
            .set_default("preprocess.resize", "bilinear")?
            .set_default(
                "preprocess.upload_max_dimension",
                default_upload_max_dimension(),
            )?
            .set_default("preprocess.jpeg_quality", default_jpeg_quality() as u64)?
            .set_default("backend.kind", "remote")?
            .set_default("backend.remote.endpoint", default_remote_endpoint())?
            .set_default(
                "backend.remote.health_endpoint",
                default_remote_health_endpoint(),
            )?
            .set_default("backend.remote.device_id", default_device_id())?
            .set_default("backend.remote.timeout_seconds", default_remote_timeout())?
            .set_default(
                "backend.remote.rate_limit_backoff_seconds",
                default_rate_limit_backoff(),
            )?
            .set_default("backend.local.model_path", default_model_path())?
            .set_default("backend.sandbox.command", "")?
            .set_default("backend.sandbox.args", Vec::<String>::new())?
            .set_default(
                "backend.sandbox.ready_timeout_seconds",
                default_sandbox_ready_timeout(),
            )?
            .set_default(
                "backend.sandbox.inference_timeout_seconds",
                default_sandbox_inference_timeout(),
            )?
            .set_default(
                "interpreter.min_confidence",
                default_min_confidence() as f64,
            )?
            .set_default("scan.interval_ms", default_scan_interval_ms())?
            .set_default("scan.auto_start", default_auto_start())?
            .set_default("scan.auto_start_delay_ms", default_auto_start_delay_ms())?
            .set_default("scan.stop_grace_ms", default_stop_grace_ms())?
            .set_default(
                "scan.max_consecutive_failures",
                default_max_consecutive_failures(),
            )?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default(
                "system.debug_log_capacity",
                default_debug_log_capacity() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // WASTESCAN_SCAN__INTERVAL_MS=1000 style overrides
            .add_source(
                Environment::with_prefix("WASTESCAN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: WastescanConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Camera resolution must be greater than 0".to_string(),
            ));
        }

        if self.camera.source == CameraSource::Directory && self.camera.directory.is_empty() {
            return Err(ConfigError::Message(
                "Camera directory must be set for the directory source".to_string(),
            ));
        }

        if self.preprocess.width == 0 || self.preprocess.height == 0 {
            return Err(ConfigError::Message(
                "Preprocess width and height must be greater than 0".to_string(),
            ));
        }

        if self.preprocess.channels != 1 && self.preprocess.channels != 3 {
            return Err(ConfigError::Message(
                "Preprocess channels must be 1 or 3".to_string(),
            ));
        }

        if !(self.preprocess.scale > 0.0) {
            return Err(ConfigError::Message(
                "Preprocess scale must be greater than 0".to_string(),
            ));
        }

        if self.preprocess.jpeg_quality == 0 || self.preprocess.jpeg_quality > 100 {
            return Err(ConfigError::Message(
                "JPEG quality must be between 1 and 100".to_string(),
            ));
        }

        match self.backend.kind {
            BackendKind::Remote => {
                if self.backend.remote.endpoint.is_empty() {
                    return Err(ConfigError::Message(
                        "Remote backend endpoint must be set".to_string(),
                    ));
                }
                if self.backend.remote.timeout_seconds == 0 {
                    return Err(ConfigError::Message(
                        "Remote timeout must be greater than 0".to_string(),
                    ));
                }
            }
            BackendKind::Local => {
                if self.backend.local.model_path.is_empty() {
                    return Err(ConfigError::Message(
                        "Local backend model_path must be set".to_string(),
                    ));
                }
            }
            BackendKind::Sandbox => {
                if self.backend.sandbox.command.is_empty() {
                    return Err(ConfigError::Message(
                        "Sandbox backend command must be set".to_string(),
                    ));
                }
            }
        }

        if !(0.0..=1.0).contains(&self.interpreter.min_confidence) {
            return Err(ConfigError::Message(
                "Interpreter min_confidence must be within [0, 1]".to_string(),
            ));
        }

        if self.scan.interval_ms == 0 {
            return Err(ConfigError::Message(
                "Scan interval must be greater than 0".to_string(),
            ));
        }

        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for WastescanConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                source: default_camera_source(),
                index: default_camera_index(),
                resolution: default_camera_resolution(),
                format: default_camera_format(),
                directory: default_camera_directory(),
                silent_capture: default_silent_capture(),
                capture_timeout_ms: default_capture_timeout_ms(),
            },
            preprocess: PreprocessConfig::default(),
            backend: BackendConfig {
                kind: default_backend_kind(),
                remote: RemoteConfig {
                    endpoint: default_remote_endpoint(),
                    health_endpoint: default_remote_health_endpoint(),
                    device_id: default_device_id(),
                    timeout_seconds: default_remote_timeout(),
                    rate_limit_backoff_seconds: default_rate_limit_backoff(),
                },
                local: LocalConfig {
                    model_path: default_model_path(),
                },
                sandbox: SandboxConfig {
                    command: String::new(),
                    args: Vec::new(),
                    ready_timeout_seconds: default_sandbox_ready_timeout(),
                    inference_timeout_seconds: default_sandbox_inference_timeout(),
                },
            },
            interpreter: InterpreterConfig {
                min_confidence: default_min_confidence(),
            },
            scan: ScanConfig::default(),
            system: SystemConfig {
                event_bus_capacity: default_event_bus_capacity(),
                debug_log_capacity: default_debug_log_capacity(),
            },
        }
    }
}

// Default value functions
fn default_camera_source() -> CameraSource {
    CameraSource::Mock
}
fn default_camera_index() -> u32 {
    0
}
fn default_camera_resolution() -> (u32, u32) {
    (640, 480)
}
fn default_camera_format() -> String {
    "MJPG".to_string()
}
fn default_camera_directory() -> String {
    "./samples".to_string()
}
fn default_silent_capture() -> bool {
    true
}
fn default_capture_timeout_ms() -> u64 {
    2000
}

fn default_input_size() -> u32 {
    224
}
fn default_channels() -> u32 {
    3
}
fn default_scale() -> f32 {
    255.0
}
fn default_upload_max_dimension() -> u32 {
    224
}
fn default_jpeg_quality() -> u8 {
    80
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Remote
}
fn default_remote_endpoint() -> String {
    "https://api.masksandmachetes.com/api/notifications/waste/classify-waste".to_string()
}
fn default_remote_health_endpoint() -> String {
    "https://api.masksandmachetes.com/api/notifications/waste/health".to_string()
}
fn default_device_id() -> String {
    "TEST_ESP32".to_string()
}
fn default_remote_timeout() -> u64 {
    15
}
fn default_rate_limit_backoff() -> u64 {
    10
}
fn default_model_path() -> String {
    "./models/waste_classifier.onnx".to_string()
}
fn default_sandbox_ready_timeout() -> u64 {
    30
}
fn default_sandbox_inference_timeout() -> u64 {
    15
}

fn default_min_confidence() -> f32 {
    0.3
}

fn default_scan_interval_ms() -> u64 {
    2500
}
fn default_auto_start() -> bool {
    true
}
fn default_auto_start_delay_ms() -> u64 {
    1000
}
fn default_stop_grace_ms() -> u64 {
    3000
}
fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_event_bus_capacity() -> usize {
    100
}
fn default_debug_log_capacity() -> usize {
    200
}
