use crate::error::Result;
use crate::frame::Frame;
use async_trait::async_trait;

/// On-demand still capture from a camera device.
///
/// Devices must be opened before `capture` succeeds; a closed device reports
/// `ScanError::DeviceNotReady`. Device-level failures surface as
/// `ScanError::CaptureFailed` and only affect the current scan cycle.
#[async_trait]
pub trait ImageCapture: Send + Sync {
    /// Short device name for logs
    fn name(&self) -> &str;

    /// Bring the device into a streaming state
    async fn open(&self) -> Result<()>;

    /// Release the device
    async fn close(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    /// Acquire a single frame
    async fn capture(&self) -> Result<Frame>;

    /// Number of frames produced so far
    fn frame_count(&self) -> u64;
}
