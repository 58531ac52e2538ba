use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Pixel layout of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameFormat {
    /// JPEG compressed still
    Jpeg,
    /// PNG compressed still
    Png,
    /// Packed 8-bit RGB, row-major
    Rgb24,
}

impl FrameFormat {
    /// Get bytes per pixel for the format
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            FrameFormat::Jpeg | FrameFormat::Png => 0, // Variable size, compressed
            FrameFormat::Rgb24 => 3,
        }
    }

    /// Check if format is compressed
    pub fn is_compressed(&self) -> bool {
        !matches!(self, FrameFormat::Rgb24)
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
            FrameFormat::Png => "image/png",
            FrameFormat::Rgb24 => "application/octet-stream",
        }
    }
}

/// One captured camera image. Lives for a single scan cycle.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame identifier assigned by the capturing device
    pub id: u64,
    /// Timestamp when frame was captured
    pub timestamp: SystemTime,
    /// Raw or encoded image bytes
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    pub format: FrameFormat,
}

impl Frame {
    pub fn new(id: u64, data: Vec<u8>, width: u32, height: u32, format: FrameFormat) -> Self {
        Self {
            id,
            timestamp: SystemTime::now(),
            data: Arc::new(data),
            width,
            height,
            format,
        }
    }

    /// Get the expected frame size for uncompressed formats
    pub fn expected_size(&self) -> Option<usize> {
        if self.format.is_compressed() {
            None
        } else {
            Some(self.width as usize * self.height as usize * self.format.bytes_per_pixel())
        }
    }

    /// Validate frame data size against expected size
    pub fn validate_size(&self) -> bool {
        match self.expected_size() {
            Some(expected) => self.data.len() == expected,
            None => !self.data.is_empty(),
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// Get frame age in milliseconds
    pub fn age_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Resize filter applied before tensor conversion. Must match the policy the
/// model was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    #[default]
    Bilinear,
    Nearest,
}

/// Shape and normalization a backend expects
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorSpec {
    pub width: u32,
    pub height: u32,
    /// 3 for RGB, 1 for luma
    pub channels: u32,
    /// Each channel value is divided by this
    pub scale: f32,
    pub resize: ResizeFilter,
}

impl TensorSpec {
    pub fn element_count(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

impl Default for TensorSpec {
    fn default() -> Self {
        Self {
            width: 224,
            height: 224,
            channels: 3,
            scale: 255.0,
            resize: ResizeFilter::Bilinear,
        }
    }
}

/// Float32 model input, row-major and channel-last (`[height, width, channels]`).
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    height: usize,
    width: usize,
    channels: usize,
}

impl Tensor {
    pub fn new(data: Vec<f32>, height: usize, width: usize, channels: usize) -> Option<Self> {
        if data.len() != height * width * channels {
            return None;
        }
        Some(Self {
            data,
            height,
            width,
            channels,
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Value at row `y`, column `x`, channel `c`
    pub fn get(&self, y: usize, x: usize, c: usize) -> Option<f32> {
        if y >= self.height || x >= self.width || c >= self.channels {
            return None;
        }
        self.data
            .get((y * self.width + x) * self.channels + c)
            .copied()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// Compressed image ready to cross a process or network boundary
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
}

impl EncodedImage {
    /// `data:` URI form used by the sandbox message contract
    pub fn to_data_url(&self) -> String {
        use base64::Engine;
        format!(
            "data:{};base64,{}",
            self.format.mime_type(),
            base64::engine::general_purpose::STANDARD.encode(&self.data)
        )
    }

    pub fn file_name(&self) -> &'static str {
        match self.format {
            FrameFormat::Png => "waste.png",
            _ => "waste.jpg",
        }
    }
}
