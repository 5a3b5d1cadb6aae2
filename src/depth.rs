use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use image::imageops::FilterType;
use ndarray::{Array2, Array4};
use ort::session::Session;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use crate::config::{DepthDomain, DepthVariant};

use crate::config::DepthConfig;
use crate::frame::Frame;
use crate::onnx::{self, LoadFailure};

/// Patch size of the ViT encoder; resized sides are multiples of it.
const PATCH_SIZE: u32 = 14;

/// Upper bound for either resized side.
const MAX_INPUT_SIDE: u32 = 14 * 256;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Dense metric depth in meters, shape `(height, width)`.
pub type DepthMap = Array2<f32>;

#[derive(Error, Debug)]
pub enum DepthError {
    #[error("depth weights not found: {path}")]
    MissingWeights { path: String },

    #[error("depth model {path} failed to load: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("inference engine error: {0}")]
    Inference(String),

    #[error("invalid model output shape: expected {expected}, got {got}")]
    InvalidOutputShape { expected: String, got: String },

    #[error("session lock poisoned")]
    LockPoisoned,
}

/// Monocular metric depth engine.
pub trait DepthEstimator: Send + Sync {
    /// Returns depth at the engine's native output resolution.
    fn estimate(&self, frame: &Frame) -> Result<DepthMap, DepthError>;
}

/// Depth Anything V2 metric model exported to ONNX.
///
/// The variant only names the encoder baked into the artifact; the domain
/// fixes the depth range for every call.
pub struct DepthAnythingEstimator {
    session: Mutex<Session>,
    variant: DepthVariant,
    domain: DepthDomain,
    input_size: u32,
}

impl DepthAnythingEstimator {
    /// # Errors
    ///
    /// Returns error if the file is absent or cannot be deserialized.
    #[instrument(skip(config), fields(path = %path.display(), variant = %config.variant, domain = %config.domain))]
    pub fn load(path: &Path, config: &DepthConfig) -> Result<Self, DepthError> {
        let session = onnx::open_session(path).map_err(|failure| match failure {
            LoadFailure::Missing => DepthError::MissingWeights {
                path: path.display().to_string(),
            },
            LoadFailure::Invalid(reason) => DepthError::ModelLoad {
                path: path.display().to_string(),
                reason,
            },
        })?;

        let encoder = config.variant.encoder_config();
        debug!(
            encoder = encoder.encoder,
            features = encoder.features,
            max_depth = config.domain.max_depth(),
            "depth model ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            variant: config.variant,
            domain: config.domain,
            input_size: config.input_size,
        })
    }

    pub fn variant(&self) -> DepthVariant {
        self.variant
    }

    pub fn domain(&self) -> DepthDomain {
        self.domain
    }

    fn preprocess(&self, frame: &Frame) -> Array4<f32> {
        let (width, height) = model_input_size(frame.width(), frame.height(), self.input_size);
        let resized = image::imageops::resize(frame.rgb(), width, height, FilterType::CatmullRom);

        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                let value = f32::from(pixel[c]) / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
        tensor
    }

    fn run_inference(&self, input: Array4<f32>) -> Result<DepthMap, DepthError> {
        let input_value = ort::value::Tensor::from_array(input)
            .map_err(|e| DepthError::Inference(onnx::sanitize("depth", &e)))?;

        let mut session = self.session.lock().map_err(|_| DepthError::LockPoisoned)?;
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| DepthError::Inference(onnx::sanitize("depth", &e)))?;

        let output = match outputs.len() {
            0 => return Err(DepthError::Inference("model produced no outputs".into())),
            _ => &outputs[0],
        };
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| DepthError::Inference(onnx::sanitize("depth", &e)))?;

        let dims = onnx::dims(shape).unwrap_or_default();
        to_depth_map(&dims, data, self.domain.max_depth())
    }
}

impl DepthEstimator for DepthAnythingEstimator {
    #[instrument(skip(self, frame), fields(width = frame.width(), height = frame.height()))]
    fn estimate(&self, frame: &Frame) -> Result<DepthMap, DepthError> {
        let start = Instant::now();
        let input = self.preprocess(frame);
        let depth = self.run_inference(input)?;

        debug!(
            out_height = depth.nrows(),
            out_width = depth.ncols(),
            inference_ms = start.elapsed().as_secs_f64() * 1000.0,
            "depth completed"
        );
        Ok(depth)
    }
}

/// Resized `(width, height)` keeping aspect ratio, both sides at least
/// `min_side` and multiples of the patch size.
fn model_input_size(width: u32, height: u32, min_side: u32) -> (u32, u32) {
    let min_side = min_side.max(PATCH_SIZE);
    let scale = (f64::from(min_side) / f64::from(width)).max(f64::from(min_side) / f64::from(height));

    let constrain = |x: f64| -> u32 {
        let patch = f64::from(PATCH_SIZE);
        let mut y = (x / patch).round() * patch;
        if y < f64::from(min_side) {
            y = (x / patch).ceil() * patch;
        }
        let side = y as u32;
        if side > MAX_INPUT_SIDE {
            warn!(side, max = MAX_INPUT_SIDE, "extreme aspect ratio, clamping depth input");
            MAX_INPUT_SIDE
        } else {
            side
        }
    };

    (constrain(scale * f64::from(width)), constrain(scale * f64::from(height)))
}

/// Accepts `[1, H, W]`, `[1, 1, H, W]` or `[H, W]` output.
fn to_depth_map(dims: &[usize], data: &[f32], max_depth: f32) -> Result<DepthMap, DepthError> {
    let (height, width) = match dims {
        [h, w] | [1, h, w] | [1, 1, h, w] => (*h, *w),
        _ => {
            return Err(DepthError::InvalidOutputShape {
                expected: "[1, H, W] or [1, 1, H, W]".into(),
                got: format!("{dims:?}"),
            })
        }
    };

    if height == 0 || width == 0 {
        return Err(DepthError::InvalidOutputShape {
            expected: "non-empty depth map".into(),
            got: format!("{dims:?}"),
        });
    }

    let mut non_finite = 0usize;
    let values = data
        .iter()
        .map(|&v| {
            if v.is_finite() {
                v.clamp(0.0, max_depth)
            } else {
                non_finite += 1;
                0.0
            }
        })
        .collect();

    if non_finite > 0 {
        warn!(non_finite, "depth output contained non-finite values");
    }

    DepthMap::from_shape_vec((height, width), values).map_err(|_| DepthError::InvalidOutputShape {
        expected: format!("{} values", height * width),
        got: format!("{} values", data.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_frame_resizes_to_min_side() {
        assert_eq!(model_input_size(640, 640, 518), (518, 518));
    }

    #[test]
    fn landscape_frame_keeps_aspect_and_patch_multiple() {
        let (w, h) = model_input_size(640, 480, 518);
        assert_eq!(h, 518);
        assert_eq!(w % PATCH_SIZE, 0);
        assert!(w >= 518);
        // 640 * 518 / 480 = 690.67 -> nearest multiple of 14
        assert_eq!(w, 686);
    }

    #[test]
    fn small_frame_is_upscaled() {
        let (w, h) = model_input_size(100, 50, 518);
        assert_eq!(h, 518);
        assert_eq!(w, 1036);
    }

    #[test]
    fn rounding_below_minimum_uses_ceiling() {
        let (w, h) = model_input_size(3, 7, 518);
        assert!(w >= 518 && h >= 518);
        assert_eq!(w % PATCH_SIZE, 0);
        assert_eq!(h % PATCH_SIZE, 0);
    }

    #[test]
    fn extreme_aspect_is_clamped() {
        let (w, h) = model_input_size(10_000, 1, 518);
        assert_eq!(w, MAX_INPUT_SIDE);
        assert_eq!(h, 518);
    }

    #[test]
    fn output_shapes_accepted() {
        let data = vec![1.0; 6];
        for dims in [vec![2, 3], vec![1, 2, 3], vec![1, 1, 2, 3]] {
            let depth = to_depth_map(&dims, &data, 20.0).unwrap();
            assert_eq!(depth.dim(), (2, 3));
        }
    }

    #[test]
    fn bad_output_shape_rejected() {
        let data = vec![1.0; 6];
        assert!(matches!(
            to_depth_map(&[2, 1, 3], &data, 20.0),
            Err(DepthError::InvalidOutputShape { .. })
        ));
        assert!(matches!(
            to_depth_map(&[1, 2, 4], &data, 20.0),
            Err(DepthError::InvalidOutputShape { .. })
        ));
    }

    #[test]
    fn values_clamped_to_domain_range() {
        let data = [-1.0, 5.0, 25.0, f32::NAN, f32::INFINITY, 20.0];
        let depth = to_depth_map(&[1, 2, 3], &data, DepthDomain::Indoor.max_depth()).unwrap();
        assert_eq!(depth.iter().copied().collect::<Vec<_>>(), vec![0.0, 5.0, 20.0, 0.0, 0.0, 20.0]);
    }

    #[test]
    fn load_missing_weights_is_reported() {
        let result = DepthAnythingEstimator::load(Path::new("/nonexistent/depth.onnx"), &DepthConfig::default());
        assert!(matches!(result, Err(DepthError::MissingWeights { .. })));
    }
}
