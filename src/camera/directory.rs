use super::interface::ImageCapture;
use crate::error::{Result, ScanError};
use crate::frame::{Frame, FrameFormat};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Replays still images from a directory, one per capture, wrapping around.
pub struct DirectoryCamera {
    directory: PathBuf,
    files: Mutex<Option<Vec<PathBuf>>>,
    frame_counter: AtomicU64,
}

impl DirectoryCamera {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            files: Mutex::new(None),
            frame_counter: AtomicU64::new(0),
        }
    }

    fn format_for(path: &Path) -> Option<FrameFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(FrameFormat::Jpeg),
            "png" => Some(FrameFormat::Png),
            _ => None,
        }
    }

    fn next_path(&self, frame_id: u64) -> Result<PathBuf> {
        let files = self.files.lock();
        let files = files.as_ref().ok_or(ScanError::DeviceNotReady)?;
        if files.is_empty() {
            return Err(ScanError::capture(format!(
                "no images in {}",
                self.directory.display()
            )));
        }
        Ok(files[(frame_id % files.len() as u64) as usize].clone())
    }
}

#[async_trait]
impl ImageCapture for DirectoryCamera {
    fn name(&self) -> &str {
        "directory"
    }

    async fn open(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.directory).await.map_err(|e| {
            ScanError::capture(format!(
                "cannot open image directory {}: {}",
                self.directory.display(),
                e
            ))
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if Self::format_for(&path).is_some() {
                files.push(path);
            } else {
                debug!("Skipping non-image file {}", path.display());
            }
        }
        files.sort();

        if files.is_empty() {
            warn!("Image directory {} has no JPEG/PNG files", self.directory.display());
        } else {
            info!(
                "Directory camera opened with {} images from {}",
                files.len(),
                self.directory.display()
            );
        }

        *self.files.lock() = Some(files);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.files.lock() = None;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.files.lock().is_some()
    }

    async fn capture(&self) -> Result<Frame> {
        let frame_id = self.frame_counter.load(Ordering::Relaxed);
        let path = self.next_path(frame_id)?;
        let format = Self::format_for(&path)
            .ok_or_else(|| ScanError::capture(format!("unsupported file {}", path.display())))?;

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| ScanError::capture(format!("failed to read {}: {}", path.display(), e)))?;

        let (width, height) = image::io::Reader::new(Cursor::new(&data))
            .with_guessed_format()
            .map_err(|e| ScanError::capture(e.to_string()))?
            .into_dimensions()
            .map_err(|e| {
                ScanError::capture(format!("unreadable image {}: {}", path.display(), e))
            })?;

        self.frame_counter.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Captured frame {} from {} ({}x{})",
            frame_id,
            path.display(),
            width,
            height
        );

        Ok(Frame::new(frame_id, data, width, height, format))
    }

    fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }
}
