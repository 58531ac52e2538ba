use super::*;
use crate::config::{CameraConfig, CameraSource, WastescanConfig};
use crate::error::ScanError;
use crate::frame::FrameFormat;
use image::{DynamicImage, ImageOutputFormat, RgbImage};

fn create_test_camera_config(source: CameraSource) -> CameraConfig {
    CameraConfig {
        source,
        resolution: (64, 48),
        ..WastescanConfig::default().camera
    }
}

fn write_image(path: &std::path::Path, width: u32, height: u32, format: ImageOutputFormat) {
    let img = DynamicImage::ImageRgb8(RgbImage::new(width, height));
    let mut file = std::fs::File::create(path).unwrap();
    img.write_to(&mut file, format).unwrap();
}

#[tokio::test]
async fn test_mock_camera_requires_open() {
    let camera = MockCamera::new(&create_test_camera_config(CameraSource::Mock));

    assert!(!camera.is_ready());
    assert!(matches!(
        camera.capture().await,
        Err(ScanError::DeviceNotReady)
    ));

    camera.open().await.unwrap();
    let frame = camera.capture().await.unwrap();
    assert_eq!((frame.width, frame.height), (64, 48));
    assert_eq!(frame.format, FrameFormat::Jpeg);
    assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
    assert_eq!(camera.frame_count(), 1);

    camera.close().await.unwrap();
    assert!(matches!(
        camera.capture().await,
        Err(ScanError::DeviceNotReady)
    ));
}

#[tokio::test]
async fn test_mock_frames_are_decodable() {
    let camera = MockCamera::with_resolution((32, 32));
    camera.open().await.unwrap();

    let first = camera.capture().await.unwrap();
    let second = camera.capture().await.unwrap();
    assert_eq!(first.id + 1, second.id);
    assert!(image::load_from_memory(&first.data).is_ok());
}

#[tokio::test]
async fn test_directory_camera_cycles_images() {
    let dir = tempfile::tempdir().unwrap();
    write_image(&dir.path().join("a.jpg"), 20, 10, ImageOutputFormat::Jpeg(90));
    write_image(&dir.path().join("b.png"), 8, 8, ImageOutputFormat::Png);
    std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

    let camera = DirectoryCamera::new(dir.path());
    assert!(matches!(
        camera.capture().await,
        Err(ScanError::DeviceNotReady)
    ));

    camera.open().await.unwrap();
    assert!(camera.is_ready());

    let first = camera.capture().await.unwrap();
    assert_eq!((first.width, first.height, first.format), (20, 10, FrameFormat::Jpeg));

    let second = camera.capture().await.unwrap();
    assert_eq!((second.width, second.height, second.format), (8, 8, FrameFormat::Png));

    let third = camera.capture().await.unwrap();
    assert_eq!(third.format, FrameFormat::Jpeg);
    assert_eq!(camera.frame_count(), 3);
}

#[tokio::test]
async fn test_directory_camera_empty_directory_fails_capture() {
    let dir = tempfile::tempdir().unwrap();
    let camera = DirectoryCamera::new(dir.path());
    camera.open().await.unwrap();

    assert!(matches!(
        camera.capture().await,
        Err(ScanError::CaptureFailed { .. })
    ));
}

#[tokio::test]
async fn test_directory_camera_missing_directory() {
    let camera = DirectoryCamera::new("/nonexistent/wastescan/images");
    assert!(matches!(
        camera.open().await,
        Err(ScanError::CaptureFailed { .. })
    ));
    assert!(!camera.is_ready());
}

#[test]
fn test_camera_builder_validation() {
    let result = CameraBuilder::new().build();
    assert!(matches!(result, Err(ScanError::System { .. })));

    let camera = CameraBuilder::new()
        .config(create_test_camera_config(CameraSource::Mock))
        .build()
        .unwrap();
    assert_eq!(camera.name(), "mock");

    let camera = CameraBuilder::new()
        .config(create_test_camera_config(CameraSource::Directory))
        .build()
        .unwrap();
    assert_eq!(camera.name(), "directory");
}
