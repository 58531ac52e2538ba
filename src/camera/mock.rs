use super::interface::ImageCapture;
use crate::config::CameraConfig;
use crate::error::{Result, ScanError};
use crate::frame::{Frame, FrameFormat};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace};

/// Synthetic camera producing JPEG stills whose color drifts per frame
pub struct MockCamera {
    resolution: (u32, u32),
    frame_counter: AtomicU64,
    is_open: AtomicBool,
}

impl MockCamera {
    pub fn new(config: &CameraConfig) -> Self {
        Self::with_resolution(config.resolution)
    }

    pub fn with_resolution(resolution: (u32, u32)) -> Self {
        Self {
            resolution,
            frame_counter: AtomicU64::new(0),
            is_open: AtomicBool::new(false),
        }
    }

    fn render(&self, frame_id: u64) -> Result<Vec<u8>> {
        let (width, height) = self.resolution;
        let color = [
            (frame_id % 256) as u8,
            128u8,
            (255 - frame_id % 256) as u8,
        ];
        let pixels: Vec<u8> = (0..width as usize * height as usize)
            .flat_map(|_| color)
            .collect();

        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, 85)
            .encode(&pixels, width, height, ColorType::Rgb8)
            .map_err(|e| ScanError::capture(format!("mock frame encoding failed: {}", e)))?;
        Ok(data)
    }
}

#[async_trait]
impl ImageCapture for MockCamera {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self) -> Result<()> {
        if !self.is_open.swap(true, Ordering::Relaxed) {
            info!(
                "Mock camera opened ({}x{})",
                self.resolution.0, self.resolution.1
            );
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.is_open.swap(false, Ordering::Relaxed) {
            debug!("Mock camera closed");
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.is_open.load(Ordering::Relaxed)
    }

    async fn capture(&self) -> Result<Frame> {
        if !self.is_ready() {
            return Err(ScanError::DeviceNotReady);
        }

        let frame_id = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        let data = self.render(frame_id)?;

        trace!(
            "Generated mock frame {} ({}x{}, {} bytes)",
            frame_id,
            self.resolution.0,
            self.resolution.1,
            data.len()
        );

        Ok(Frame::new(
            frame_id,
            data,
            self.resolution.0,
            self.resolution.1,
            FrameFormat::Jpeg,
        ))
    }

    fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }
}
