use crate::config::PreprocessConfig;
use crate::error::{Result, ScanError};
use crate::frame::{EncodedImage, Frame, FrameFormat, ResizeFilter, Tensor, TensorSpec};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, RgbImage};
use tracing::trace;

/// Converts captured frames into what a backend consumes: a normalized
/// tensor for local runtimes, or a compact JPEG for image-consuming backends.
#[derive(Debug, Clone)]
pub struct FramePreprocessor {
    spec: TensorSpec,
    upload_max_dimension: u32,
    jpeg_quality: u8,
}

impl FramePreprocessor {
    pub fn new(config: &PreprocessConfig) -> Self {
        Self {
            spec: config.tensor_spec(),
            upload_max_dimension: config.upload_max_dimension,
            jpeg_quality: config.jpeg_quality,
        }
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    /// Decode, resize and normalize a frame into a `[H, W, C]` float tensor.
    pub fn prepare(&self, frame: &Frame) -> Result<Tensor> {
        prepare_tensor(frame, &self.spec)
    }

    /// Re-encode a frame as JPEG, downscaled so its longest side is at most
    /// `upload_max_dimension`. JPEG frames already small enough pass through.
    pub fn encode_for_upload(&self, frame: &Frame) -> Result<EncodedImage> {
        check_frame(frame)?;

        let fits = frame.width.max(frame.height) <= self.upload_max_dimension;
        if frame.format == FrameFormat::Jpeg && fits {
            return Ok(EncodedImage {
                data: frame.data.as_ref().clone(),
                width: frame.width,
                height: frame.height,
                format: FrameFormat::Jpeg,
            });
        }

        let mut rgb = decode_rgb(frame)?;
        if !fits {
            let (width, height) = fit_within(rgb.width(), rgb.height(), self.upload_max_dimension);
            rgb = image::imageops::resize(&rgb, width, height, filter_type(self.spec.resize));
        }

        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, self.jpeg_quality)
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
            .map_err(|e| ScanError::invalid_frame(format!("JPEG encoding failed: {}", e)))?;

        trace!(
            "Encoded frame {} for upload: {}x{}, {} bytes",
            frame.id,
            rgb.width(),
            rgb.height(),
            data.len()
        );

        Ok(EncodedImage {
            data,
            width: rgb.width(),
            height: rgb.height(),
            format: FrameFormat::Jpeg,
        })
    }
}

/// Tensor conversion with an explicit spec
pub fn prepare_tensor(frame: &Frame, spec: &TensorSpec) -> Result<Tensor> {
    check_frame(frame)?;
    if spec.width == 0 || spec.height == 0 || spec.scale <= 0.0 {
        return Err(ScanError::system(format!(
            "invalid tensor spec {}x{} scale {}",
            spec.width, spec.height, spec.scale
        )));
    }

    let rgb = decode_rgb(frame)?;
    let resized = if rgb.width() == spec.width && rgb.height() == spec.height {
        rgb
    } else {
        image::imageops::resize(&rgb, spec.width, spec.height, filter_type(spec.resize))
    };

    let mut data = Vec::with_capacity(spec.element_count());
    match spec.channels {
        3 => {
            for pixel in resized.pixels() {
                data.extend(pixel.0.iter().map(|v| *v as f32 / spec.scale));
            }
        }
        1 => {
            let luma = DynamicImage::ImageRgb8(resized).to_luma8();
            data.extend(luma.as_raw().iter().map(|v| *v as f32 / spec.scale));
        }
        other => {
            return Err(ScanError::system(format!(
                "unsupported channel count {}",
                other
            )))
        }
    }

    Tensor::new(
        data,
        spec.height as usize,
        spec.width as usize,
        spec.channels as usize,
    )
    .ok_or_else(|| ScanError::system("tensor size does not match spec"))
}

fn check_frame(frame: &Frame) -> Result<()> {
    if frame.width == 0 || frame.height == 0 {
        return Err(ScanError::invalid_frame(format!(
            "frame {} has degenerate dimensions {}x{}",
            frame.id, frame.width, frame.height
        )));
    }
    if !frame.validate_size() {
        return Err(ScanError::invalid_frame(format!(
            "frame {} holds {} bytes, not a {}x{} {:?} image",
            frame.id,
            frame.data.len(),
            frame.width,
            frame.height,
            frame.format
        )));
    }
    Ok(())
}

fn decode_rgb(frame: &Frame) -> Result<RgbImage> {
    match frame.format {
        FrameFormat::Rgb24 => RgbImage::from_raw(frame.width, frame.height, frame.data.to_vec())
            .ok_or_else(|| ScanError::invalid_frame("RGB buffer does not match dimensions")),
        FrameFormat::Jpeg | FrameFormat::Png => {
            let decoded = image::load_from_memory(&frame.data).map_err(|e| {
                ScanError::invalid_frame(format!("failed to decode frame {}: {}", frame.id, e))
            })?;
            if decoded.width() == 0 || decoded.height() == 0 {
                return Err(ScanError::invalid_frame("decoded image is empty"));
            }
            Ok(decoded.to_rgb8())
        }
    }
}

fn filter_type(filter: ResizeFilter) -> FilterType {
    match filter {
        ResizeFilter::Bilinear => FilterType::Triangle,
        ResizeFilter::Nearest => FilterType::Nearest,
    }
}

fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height).max(1);
    let scale = max_dimension as f64 / longest as f64;
    (
        ((width as f64 * scale).round() as u32).max(1),
        ((height as f64 * scale).round() as u32).max(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgb};
    use std::io::Cursor;

    fn solid_rgb_frame(width: u32, height: u32, color: [u8; 3]) -> Frame {
        let data: Vec<u8> = (0..width * height).flat_map(|_| color).collect();
        Frame::new(1, data, width, height, FrameFormat::Rgb24)
    }

    fn jpeg_frame(width: u32, height: u32, color: [u8; 3]) -> Frame {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageOutputFormat::Jpeg(95))
            .unwrap();
        Frame::new(7, buf.into_inner(), width, height, FrameFormat::Jpeg)
    }

    #[test]
    fn test_tensor_shape_and_scaling() {
        let preprocessor = FramePreprocessor::new(&PreprocessConfig::default());
        let tensor = preprocessor
            .prepare(&solid_rgb_frame(100, 50, [255, 0, 128]))
            .unwrap();

        assert_eq!(tensor.shape(), [224, 224, 3]);
        assert_eq!(tensor.as_slice().len(), 224 * 224 * 3);
        assert_eq!(tensor.get(0, 0, 0), Some(1.0));
        assert_eq!(tensor.get(100, 100, 1), Some(0.0));
        let blue = tensor.get(223, 223, 2).unwrap();
        assert!((blue - 128.0 / 255.0).abs() < 1e-6);
        assert!(tensor.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_channel_last_ordering() {
        // Left column red, right column green; nearest keeps them exact
        let frame = Frame::new(
            1,
            vec![255, 0, 0, 0, 255, 0],
            2,
            1,
            FrameFormat::Rgb24,
        );
        let spec = TensorSpec {
            width: 2,
            height: 1,
            resize: ResizeFilter::Nearest,
            ..TensorSpec::default()
        };
        let tensor = prepare_tensor(&frame, &spec).unwrap();
        assert_eq!(tensor.as_slice(), &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_decodes_jpeg_frames() {
        let preprocessor = FramePreprocessor::new(&PreprocessConfig::default());
        let tensor = preprocessor.prepare(&jpeg_frame(64, 48, [200, 200, 200])).unwrap();
        assert_eq!(tensor.shape(), [224, 224, 3]);
        let value = tensor.get(112, 112, 0).unwrap();
        assert!((value - 200.0 / 255.0).abs() < 0.05);
    }

    #[test]
    fn test_single_channel_spec() {
        let spec = TensorSpec {
            width: 8,
            height: 8,
            channels: 1,
            ..TensorSpec::default()
        };
        let tensor = prepare_tensor(&solid_rgb_frame(16, 16, [255, 255, 255]), &spec).unwrap();
        assert_eq!(tensor.shape(), [8, 8, 1]);
        assert!(tensor.as_slice().iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_degenerate_frames_rejected() {
        let preprocessor = FramePreprocessor::new(&PreprocessConfig::default());

        let zero_width = Frame::new(1, vec![1, 2, 3], 0, 10, FrameFormat::Jpeg);
        assert!(matches!(
            preprocessor.prepare(&zero_width),
            Err(ScanError::InvalidFrame { .. })
        ));
        assert!(matches!(
            preprocessor.encode_for_upload(&zero_width),
            Err(ScanError::InvalidFrame { .. })
        ));

        let truncated = Frame::new(2, vec![0; 10], 4, 4, FrameFormat::Rgb24);
        assert!(matches!(
            preprocessor.prepare(&truncated),
            Err(ScanError::InvalidFrame { .. })
        ));

        let garbage = Frame::new(3, vec![0xAB; 64], 8, 8, FrameFormat::Jpeg);
        assert!(matches!(
            preprocessor.prepare(&garbage),
            Err(ScanError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_upload_encoding_downscales() {
        let preprocessor = FramePreprocessor::new(&PreprocessConfig::default());

        let encoded = preprocessor
            .encode_for_upload(&solid_rgb_frame(640, 480, [10, 20, 30]))
            .unwrap();
        assert_eq!(encoded.format, FrameFormat::Jpeg);
        assert_eq!((encoded.width, encoded.height), (224, 168));
        assert_eq!(&encoded.data[..2], &[0xFF, 0xD8]);

        let small = jpeg_frame(100, 100, [1, 2, 3]);
        let passthrough = preprocessor.encode_for_upload(&small).unwrap();
        assert_eq!(passthrough.data, *small.data);
    }
}
