use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::align::{zip_to_shortest, Alignment};
use crate::config::{ConfigError, PipelineConfig, RuntimeConfig};
use crate::depth::{DepthAnythingEstimator, DepthError, DepthEstimator};
use crate::frame::{Frame, FrameError, ImageInput};
use crate::geometry::{CameraIntrinsics, GeometryError, PointCloudReconstructor};
use crate::labels::ClassNames;
use crate::resample::{resize_depth, resize_mask};
use crate::segmentation::{Mask, SegmentationError, Segmenter, SegmenterSettings, YoloSegmenter};
use crate::weights::{WeightStore, WeightsError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("model weights unavailable: {0}")]
    Weights(#[from] WeightsError),

    #[error("failed to decode input image: {0}")]
    Decode(#[from] FrameError),

    #[error("segmentation failed: {0}")]
    Segmentation(#[from] SegmentationError),

    #[error("depth estimation failed: {0}")]
    Depth(#[from] DepthError),

    #[error("volume reconstruction failed: {0}")]
    Geometry(#[from] GeometryError),
}

/// Coarse failure class for callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or corrupt weights, bad settings; fatal, never retried.
    Configuration,
    /// The image could not be decoded.
    Input,
    Inference,
    Geometry,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Weights(_) => ErrorKind::Configuration,
            Self::Segmentation(
                SegmentationError::MissingWeights { .. } | SegmentationError::ModelLoad { .. },
            )
            | Self::Depth(DepthError::MissingWeights { .. } | DepthError::ModelLoad { .. }) => {
                ErrorKind::Configuration
            }
            Self::Decode(_) => ErrorKind::Input,
            Self::Segmentation(_) | Self::Depth(_) => ErrorKind::Inference,
            Self::Geometry(_) => ErrorKind::Geometry,
        }
    }
}

/// Per-object output record.
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub object_name: String,
    /// Cubic meters.
    pub volume: f64,
    /// `[x1, y1, x2, y2]` in frame pixels.
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    pub score: f32,
    /// Binary mask at frame resolution.
    #[serde(skip)]
    pub mask: Mask,
    /// Not derived; no density table is applied.
    pub weight: Option<f64>,
    pub density: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    pub decode_ms: f64,
    pub depth_ms: f64,
    pub segmentation_ms: f64,
    pub reconstruction_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    pub predictions: Vec<Prediction>,
    /// Instances lost to output length disagreement.
    pub dropped: usize,
    pub timings: StageTimings,
}

/// Runs segmentation, depth and reconstruction for one image at a time.
///
/// Models are loaded once and reused across calls.
pub struct VolumePredictor<S = YoloSegmenter, D = DepthAnythingEstimator> {
    segmenter: S,
    depth: D,
    reconstructor: PointCloudReconstructor,
    parallel_stages: bool,
}

/// Predictor backed by the bundled ONNX engines.
pub type OnnxVolumePredictor = VolumePredictor<YoloSegmenter, DepthAnythingEstimator>;

impl OnnxVolumePredictor {
    /// Resolves weights and loads both ONNX models.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or either model cannot be
    /// fetched or deserialized.
    #[instrument(skip(config))]
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let store = WeightStore::from_config(&config.weights)?;
        let seg_path = store.resolve(&config.segmentation.artifact)?;
        let depth_path = store.resolve(&config.depth.resolved_artifact())?;

        let class_names = match &config.segmentation.class_names_path {
            Some(path) => ClassNames::from_id2label_file(path)?,
            None => ClassNames::foodseg103(),
        };

        let segmenter = YoloSegmenter::load(
            &seg_path,
            SegmenterSettings::from(&config.segmentation),
            class_names,
        )?;
        let depth = DepthAnythingEstimator::load(&depth_path, &config.depth)?;

        info!(
            variant = %config.depth.variant,
            domain = %config.depth.domain,
            "volume predictor ready"
        );

        Ok(Self::new(
            segmenter,
            depth,
            CameraIntrinsics::from(config.camera),
            &config.runtime,
        ))
    }
}

impl<S: Segmenter, D: DepthEstimator> VolumePredictor<S, D> {
    pub fn new(segmenter: S, depth: D, intrinsics: CameraIntrinsics, runtime: &RuntimeConfig) -> Self {
        Self {
            segmenter,
            depth,
            reconstructor: PointCloudReconstructor::new(intrinsics),
            parallel_stages: runtime.parallel_stages,
        }
    }

    pub fn segmenter(&self) -> &S {
        &self.segmenter
    }

    pub fn depth_estimator(&self) -> &D {
        &self.depth
    }

    pub fn intrinsics(&self) -> CameraIntrinsics {
        self.reconstructor.intrinsics()
    }

    /// Predictions in detection order.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Decode` for unreadable input, or the failing
    /// stage's error.
    pub fn predict(&self, input: impl Into<ImageInput>) -> Result<Vec<Prediction>, PipelineError> {
        self.predict_with_report(input).map(|report| report.predictions)
    }

    #[instrument(skip(self, input))]
    pub fn predict_with_report(
        &self,
        input: impl Into<ImageInput>,
    ) -> Result<PredictionReport, PipelineError> {
        let start = Instant::now();
        let frame = Frame::decode(input.into())?;
        let decode_ms = elapsed_ms(start);

        let (depth, segmentation) = if self.parallel_stages {
            rayon::join(
                || timed(|| self.depth.estimate(&frame)),
                || timed(|| self.segmenter.segment(&frame)),
            )
        } else {
            let depth = timed(|| self.depth.estimate(&frame));
            let segmentation = timed(|| self.segmenter.segment(&frame));
            (depth, segmentation)
        };
        let (depth, depth_ms) = depth;
        let (segmentation, segmentation_ms) = segmentation;
        let depth = depth?;
        let mut segmentation = segmentation?;

        let reconstruction_start = Instant::now();
        let (width, height) = (frame.width() as usize, frame.height() as usize);
        let depth = resize_depth(&depth, width, height);
        segmentation.masks = segmentation
            .masks
            .par_iter()
            .map(|mask| resize_mask(mask, width, height))
            .collect();

        let volumes = self
            .reconstructor
            .volumes(width, height, &depth, &segmentation.masks)?;
        let Alignment { instances, dropped } = zip_to_shortest(segmentation, volumes);
        let reconstruction_ms = elapsed_ms(reconstruction_start);

        let class_names = self.segmenter.class_names();
        let predictions: Vec<Prediction> = instances
            .into_iter()
            .map(|instance| Prediction {
                object_name: class_names.name(instance.class_id),
                volume: instance.volume,
                bbox: instance.bbox,
                score: instance.score,
                mask: instance.mask,
                weight: None,
                density: None,
            })
            .collect();

        let timings = StageTimings {
            decode_ms,
            depth_ms,
            segmentation_ms,
            reconstruction_ms,
            total_ms: elapsed_ms(start),
        };
        debug!(
            predictions = predictions.len(),
            dropped,
            decode_ms,
            depth_ms,
            segmentation_ms,
            reconstruction_ms,
            total_ms = timings.total_ms,
            "prediction completed"
        );

        Ok(PredictionReport {
            predictions,
            dropped,
            timings,
        })
    }
}

fn timed<T>(f: impl FnOnce() -> T) -> (T, f64) {
    let start = Instant::now();
    let out = f();
    (out, elapsed_ms(start))
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
