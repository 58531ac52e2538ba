use super::interface::ImageCapture;
use crate::config::CameraConfig;
use crate::error::{Result, ScanError};
use crate::frame::{Frame, FrameFormat};
use async_trait::async_trait;
use gstreamer::prelude::*;
use gstreamer::Pipeline;
use gstreamer_app::AppSink;
use gstreamer_video::VideoInfo;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// V4L2 still capture through a GStreamer MJPEG pipeline.
///
/// The appsink keeps only the newest sample, so each `capture` returns a
/// fresh frame rather than a queued one.
pub struct GstreamerCamera {
    config: CameraConfig,
    pipeline: Mutex<Option<Pipeline>>,
    is_running: AtomicBool,
    frame_counter: Arc<AtomicU64>,
}

impl GstreamerCamera {
    pub fn new(config: CameraConfig) -> Result<Self> {
        info!(
            "Initializing GStreamer camera for device {} ({}x{})",
            config.index, config.resolution.0, config.resolution.1
        );

        gstreamer::init().map_err(|e| {
            ScanError::capture(format!("Failed to initialize GStreamer: {}", e))
        })?;

        if config.silent_capture {
            debug!("Silent capture requested; V4L2 devices have no shutter indicator");
        }

        Ok(Self {
            config,
            pipeline: Mutex::new(None),
            is_running: AtomicBool::new(false),
            frame_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Build GStreamer pipeline string for MJPEG capture
    fn build_pipeline_string(&self) -> Result<String> {
        if !self.config.format.eq_ignore_ascii_case("MJPG")
            && !self.config.format.eq_ignore_ascii_case("MJPEG")
        {
            return Err(ScanError::capture(format!(
                "unsupported camera format {}",
                self.config.format
            )));
        }

        let (width, height) = self.config.resolution;
        Ok(format!(
            "v4l2src device=/dev/video{} io-mode=mmap do-timestamp=true ! \
             image/jpeg,width={},height={} ! \
             appsink name=sink sync=false max-buffers=1 drop=true enable-last-sample=false",
            self.config.index, width, height
        ))
    }

    fn pull_frame(
        appsink: &AppSink,
        timeout_ms: u64,
        frame_counter: &AtomicU64,
    ) -> Result<Frame> {
        let sample = appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout_ms))
            .ok_or_else(|| {
                ScanError::capture(format!("no frame within {}ms", timeout_ms))
            })?;

        let buffer = sample
            .buffer()
            .ok_or_else(|| ScanError::capture("No buffer in sample"))?;
        let caps = sample
            .caps()
            .ok_or_else(|| ScanError::capture("No caps in sample"))?;

        let (width, height) = match VideoInfo::from_caps(caps) {
            Ok(info) => (info.width(), info.height()),
            Err(_) => {
                // image/jpeg caps are not raw video; read them directly
                let s = caps
                    .structure(0)
                    .ok_or_else(|| ScanError::capture("Empty caps in sample"))?;
                let width = s.get::<i32>("width").unwrap_or(0).max(0) as u32;
                let height = s.get::<i32>("height").unwrap_or(0).max(0) as u32;
                (width, height)
            }
        };

        let map = buffer
            .map_readable()
            .map_err(|e| ScanError::capture(format!("Failed to map buffer: {}", e)))?;

        let frame_id = frame_counter.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Captured MJPEG frame {} ({}x{}, {} bytes)",
            frame_id,
            width,
            height,
            map.len()
        );

        Ok(Frame::new(
            frame_id,
            map.as_slice().to_vec(),
            width,
            height,
            FrameFormat::Jpeg,
        ))
    }
}

#[async_trait]
impl ImageCapture for GstreamerCamera {
    fn name(&self) -> &str {
        "v4l2"
    }

    async fn open(&self) -> Result<()> {
        if self.is_running.load(Ordering::Relaxed) {
            warn!("GStreamer camera is already open");
            return Ok(());
        }

        let pipeline_desc = self.build_pipeline_string()?;
        info!("Creating GStreamer pipeline: {}", pipeline_desc);

        let pipeline = gstreamer::parse::launch(&pipeline_desc)
            .map_err(|e| ScanError::capture(format!("Failed to create pipeline: {}", e)))?
            .downcast::<Pipeline>()
            .map_err(|_| ScanError::capture("Failed to downcast to Pipeline"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| ScanError::capture(format!("Failed to start pipeline: {}", e)))?;

        *self.pipeline.lock() = Some(pipeline);
        self.is_running.store(true, Ordering::Relaxed);
        info!("GStreamer pipeline started successfully");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pipeline) = self.pipeline.lock().take() {
            let _ = pipeline.set_state(gstreamer::State::Null);
        }
        self.is_running.store(false, Ordering::Relaxed);
        info!("GStreamer camera closed");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    async fn capture(&self) -> Result<Frame> {
        let appsink = {
            let pipeline = self.pipeline.lock();
            let pipeline = pipeline.as_ref().ok_or(ScanError::DeviceNotReady)?;
            pipeline
                .by_name("sink")
                .ok_or_else(|| ScanError::capture("Failed to get appsink"))?
                .downcast::<AppSink>()
                .map_err(|_| ScanError::capture("Failed to downcast to AppSink"))?
        };

        let timeout_ms = self.config.capture_timeout_ms;
        let frame_counter = Arc::clone(&self.frame_counter);

        tokio::task::spawn_blocking(move || Self::pull_frame(&appsink, timeout_ms, &frame_counter))
            .await
            .map_err(|e| ScanError::capture(format!("capture task failed: {}", e)))?
    }

    fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }
}
