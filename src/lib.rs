//! Food volume estimation from a single RGB photograph.
//!
//! An instance segmenter and a monocular metric depth model run on the same
//! frame; masked pixels are back-projected through a pinhole camera and each
//! instance's volume is the volume of its point cloud's convex hull.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod align;
pub mod config;
pub mod depth;
pub mod frame;
pub mod geometry;
pub mod labels;
mod onnx;
pub mod pipeline;
pub mod resample;
pub mod segmentation;
pub mod service;
pub mod weights;

pub use config::PipelineConfig;
pub use depth::{DepthAnythingEstimator, DepthError, DepthEstimator, DepthMap};
pub use frame::{Frame, FrameError, ImageInput};
pub use geometry::{CameraIntrinsics, GeometryError, PointCloudReconstructor};
pub use labels::ClassNames;
pub use pipeline::{
    ErrorKind, OnnxVolumePredictor, Prediction, PipelineError, PredictionReport, StageTimings,
    VolumePredictor,
};
pub use segmentation::{Mask, Segmentation, SegmentationError, Segmenter, YoloSegmenter};
pub use service::{ServiceError, VolumeService};
pub use weights::{ModelArtifact, WeightStore, WeightsError};
