use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GenericImageView, ImageReader, Limits, RgbImage};
use thiserror::Error;
use tracing::{debug, instrument};

/// Maximum encoded input size (50MB)
const MAX_INPUT_BYTES: usize = 50 * 1024 * 1024;

/// Maximum decoded pixel count (100 megapixels) - prevents decompression bombs
const MAX_PIXELS: u64 = 100_000_000;

const MAX_DIMENSION: u32 = 15_000;
const MAX_ALLOC_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("unsupported image format")]
    UnsupportedFormat,
}

/// One image handed to the pipeline.
#[derive(Debug, Clone)]
pub enum ImageInput {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Image(DynamicImage),
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ImageInput {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for ImageInput {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(image: DynamicImage) -> Self {
        Self::Image(image)
    }
}

impl From<RgbImage> for ImageInput {
    fn from(image: RgbImage) -> Self {
        Self::Image(DynamicImage::ImageRgb8(image))
    }
}

/// Immutable RGB raster; the unit of work for one prediction.
#[derive(Debug, Clone)]
pub struct Frame {
    rgb: RgbImage,
}

impl Frame {
    /// Decodes any accepted input into an RGB frame.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or the bytes do not decode to
    /// a non-empty image within the size limits.
    #[instrument(skip(input))]
    pub fn decode(input: ImageInput) -> Result<Self, FrameError> {
        let image = match input {
            ImageInput::Path(path) => {
                let bytes = std::fs::read(&path).map_err(|source| FrameError::Io {
                    path: path.clone(),
                    source,
                })?;
                decode_bytes(&bytes)?
            }
            ImageInput::Bytes(bytes) => decode_bytes(&bytes)?,
            ImageInput::Image(image) => image,
        };

        Self::from_dynamic(image)
    }

    fn from_dynamic(image: DynamicImage) -> Result<Self, FrameError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }

        let pixels = u64::from(width) * u64::from(height);
        if pixels > MAX_PIXELS {
            return Err(FrameError::ImageTooLarge {
                width,
                height,
                pixels,
                max_pixels: MAX_PIXELS,
            });
        }

        debug!(width, height, "frame decoded");
        Ok(Self {
            rgb: image.to_rgb8(),
        })
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    /// `(width, height)`
    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }
}

impl TryFrom<RgbImage> for Frame {
    type Error = FrameError;

    fn try_from(rgb: RgbImage) -> Result<Self, Self::Error> {
        Self::from_dynamic(DynamicImage::ImageRgb8(rgb))
    }
}

fn decode_bytes(raw_bytes: &[u8]) -> Result<DynamicImage, FrameError> {
    if raw_bytes.is_empty() {
        return Err(FrameError::EmptyInput);
    }

    if raw_bytes.len() > MAX_INPUT_BYTES {
        return Err(FrameError::InputTooLarge {
            size: raw_bytes.len(),
            max_size: MAX_INPUT_BYTES,
        });
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| FrameError::Decode { source: e.into() })?;

    if reader.format().is_none() {
        return Err(FrameError::UnsupportedFormat);
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DIMENSION);
    limits.max_image_height = Some(MAX_DIMENSION);
    limits.max_alloc = Some(MAX_ALLOC_BYTES);
    reader.limits(limits);

    Ok(reader.decode()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ExtendedColorType, ImageEncoder};

    fn create_test_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut buffer = Vec::new();
        image::codecs::png::PngEncoder::new(&mut buffer)
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)
            .unwrap();
        buffer
    }

    #[test]
    fn decode_png_bytes_records_dimensions() {
        let frame = Frame::decode(ImageInput::from(create_test_png(64, 48))).unwrap();
        assert_eq!(frame.dimensions(), (64, 48));
    }

    #[test]
    fn decode_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plate.png");
        std::fs::write(&path, create_test_png(10, 20)).unwrap();

        let frame = Frame::decode(ImageInput::from(path.as_path())).unwrap();
        assert_eq!(frame.width(), 10);
        assert_eq!(frame.height(), 20);
    }

    #[test]
    fn decode_from_in_memory_image_converts_to_rgb() {
        let luma = image::GrayImage::from_pixel(5, 4, image::Luma([200]));
        let frame = Frame::decode(ImageInput::from(DynamicImage::ImageLuma8(luma))).unwrap();
        assert_eq!(frame.rgb().get_pixel(0, 0).0, [200, 200, 200]);
    }

    #[test]
    fn decode_rejects_empty() {
        assert!(matches!(
            Frame::decode(ImageInput::Bytes(Vec::new())),
            Err(FrameError::EmptyInput)
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Frame::decode(ImageInput::Bytes(vec![0xFF, 0xFE, 0x00])).is_err());
    }

    #[test]
    fn decode_missing_path_reports_path() {
        let err = Frame::decode(ImageInput::Path(PathBuf::from("/nonexistent/meal.jpg")))
            .unwrap_err();
        match err {
            FrameError::Io { path, .. } => assert!(path.ends_with("meal.jpg")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn zero_sized_image_rejected() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(matches!(
            Frame::decode(ImageInput::Image(empty)),
            Err(FrameError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn rgb_buffer_conversion_applies_frame_checks() {
        assert!(matches!(
            Frame::try_from(RgbImage::new(0, 0)),
            Err(FrameError::InvalidDimensions { width: 0, height: 0 })
        ));
        assert!(matches!(
            Frame::try_from(RgbImage::new(7, 0)),
            Err(FrameError::InvalidDimensions { .. })
        ));

        let frame = Frame::try_from(RgbImage::new(5, 3)).unwrap();
        assert_eq!(frame.dimensions(), (5, 3));
    }
}
