use super::directory::DirectoryCamera;
use super::interface::ImageCapture;
use super::mock::MockCamera;
use crate::config::{CameraConfig, CameraSource};
use crate::error::{Result, ScanError};
use std::sync::Arc;

/// Builder selecting a capture device from configuration
pub struct CameraBuilder {
    config: Option<CameraConfig>,
}

impl CameraBuilder {
    pub fn new() -> Self {
        Self { config: None }
    }

    pub fn config(mut self, config: CameraConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Arc<dyn ImageCapture>> {
        let config = self
            .config
            .ok_or_else(|| ScanError::system("Camera configuration must be specified"))?;

        match config.source {
            CameraSource::Mock => Ok(Arc::new(MockCamera::new(&config))),
            CameraSource::Directory => Ok(Arc::new(DirectoryCamera::new(&config.directory))),
            CameraSource::V4l2 => build_v4l2(config),
        }
    }
}

impl Default for CameraBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(feature = "camera", target_os = "linux"))]
fn build_v4l2(config: CameraConfig) -> Result<Arc<dyn ImageCapture>> {
    Ok(Arc::new(super::gstreamer::GstreamerCamera::new(config)?))
}

#[cfg(not(all(feature = "camera", target_os = "linux")))]
fn build_v4l2(_config: CameraConfig) -> Result<Arc<dyn ImageCapture>> {
    Err(ScanError::system(
        "V4L2 capture requires Linux and the `camera` feature",
    ))
}
