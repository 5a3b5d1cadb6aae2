//! Pipeline configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::weights::ModelArtifact;

pub const DEFAULT_FOCAL_LENGTH: f64 = 470.4;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.70;

const ENV_CACHE_DIR: &str = "FOOD_VOLUME_CACHE_DIR";
const ENV_ENDPOINT: &str = "FOOD_VOLUME_ENDPOINT";
const ENV_SEG_WEIGHTS: &str = "FOOD_VOLUME_SEG_WEIGHTS";
const ENV_DEPTH_WEIGHTS: &str = "FOOD_VOLUME_DEPTH_WEIGHTS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown depth model variant: {0:?} (expected small/base/large or vits/vitb/vitl)")]
    UnknownVariant(String),

    #[error("unknown depth domain: {0:?} (expected indoor or outdoor)")]
    UnknownDomain(String),

    #[error("{name} must be within [0, 1], got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("{name} must be positive and finite, got {value}")]
    InvalidFocalLength { name: &'static str, value: f64 },

    #[error("{name} must be non-zero")]
    InvalidSize { name: &'static str },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),
}

/// Depth Anything V2 encoder size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DepthVariant {
    #[default]
    Small,
    Base,
    Large,
}

/// Network width of one encoder variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub encoder: &'static str,
    pub features: u32,
    pub out_channels: [u32; 4],
}

impl DepthVariant {
    pub const fn encoder_config(self) -> EncoderConfig {
        match self {
            Self::Small => EncoderConfig {
                encoder: "vits",
                features: 64,
                out_channels: [48, 96, 192, 384],
            },
            Self::Base => EncoderConfig {
                encoder: "vitb",
                features: 128,
                out_channels: [96, 192, 384, 768],
            },
            Self::Large => EncoderConfig {
                encoder: "vitl",
                features: 256,
                out_channels: [256, 512, 1024, 1024],
            },
        }
    }

    pub const fn encoder(self) -> &'static str {
        self.encoder_config().encoder
    }
}

impl FromStr for DepthVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" | "vits" | "s" => Ok(Self::Small),
            "base" | "vitb" | "b" => Ok(Self::Base),
            "large" | "vitl" | "l" => Ok(Self::Large),
            _ => Err(ConfigError::UnknownVariant(s.to_string())),
        }
    }
}

impl TryFrom<String> for DepthVariant {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DepthVariant> for String {
    fn from(value: DepthVariant) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DepthVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Small => "small",
            Self::Base => "base",
            Self::Large => "large",
        })
    }
}

/// Training domain of the metric depth head; fixes the maximum depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DepthDomain {
    #[default]
    Indoor,
    Outdoor,
}

impl DepthDomain {
    /// Maximum depth in meters.
    pub const fn max_depth(self) -> f32 {
        match self {
            Self::Indoor => 20.0,
            Self::Outdoor => 80.0,
        }
    }

    pub const fn dataset(self) -> &'static str {
        match self {
            Self::Indoor => "hypersim",
            Self::Outdoor => "vkitti",
        }
    }
}

impl FromStr for DepthDomain {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indoor" | "hypersim" => Ok(Self::Indoor),
            "outdoor" | "vkitti" => Ok(Self::Outdoor),
            _ => Err(ConfigError::UnknownDomain(s.to_string())),
        }
    }
}

impl TryFrom<String> for DepthDomain {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DepthDomain> for String {
    fn from(value: DepthDomain) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DepthDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Indoor => "indoor",
            Self::Outdoor => "outdoor",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Square model input side in pixels.
    pub input_size: u32,
    pub mask_threshold: f32,
    pub max_detections: usize,
    pub artifact: ModelArtifact,
    /// Optional `id2label` JSON replacing the built-in FoodSeg103 table.
    pub class_names_path: Option<PathBuf>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            input_size: 640,
            mask_threshold: 0.5,
            max_detections: 300,
            artifact: ModelArtifact::new("food-volume/yolov8-foodseg103", "yolov8_foodseg103.onnx"),
            class_names_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    pub variant: DepthVariant,
    pub domain: DepthDomain,
    /// Lower bound for the shorter resized side; rounded to a multiple of 14.
    pub input_size: u32,
    /// Defaults to the artifact matching `variant` and `domain`.
    pub artifact: Option<ModelArtifact>,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            variant: DepthVariant::default(),
            domain: DepthDomain::default(),
            input_size: 518,
            artifact: None,
        }
    }
}

impl DepthConfig {
    pub fn resolved_artifact(&self) -> ModelArtifact {
        self.artifact.clone().unwrap_or_else(|| {
            ModelArtifact::new(
                "food-volume/depth-anything-v2-metric",
                format!(
                    "depth_anything_v2_metric_{}_{}.onnx",
                    self.domain.dataset(),
                    self.variant.encoder()
                ),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub focal_length_x: f64,
    pub focal_length_y: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            focal_length_x: DEFAULT_FOCAL_LENGTH,
            focal_length_y: DEFAULT_FOCAL_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub cache_dir: PathBuf,
    /// Remote model store base URL; `None` disables fetching.
    pub endpoint: Option<String>,
    pub max_download_bytes: u64,
    pub timeout_secs: u64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .map(|mut p| {
                p.push("food-volume");
                p.push("models");
                p
            })
            .unwrap_or_else(|| PathBuf::from("./models"));

        Self {
            cache_dir,
            endpoint: Some("https://huggingface.co".into()),
            max_download_bytes: 2 * 1024 * 1024 * 1024,
            timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run segmentation and depth inference concurrently.
    pub parallel_stages: bool,
    /// In-flight predictions admitted by the async service.
    pub max_concurrent: usize,
    pub deadline_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            parallel_stages: false,
            max_concurrent: 2,
            deadline_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub segmentation: SegmentationConfig,
    pub depth: DepthConfig,
    pub camera: CameraConfig,
    pub weights: WeightsConfig,
    pub runtime: RuntimeConfig,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Applies `FOOD_VOLUME_*` environment variables on top of this config.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.weights.cache_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.weights.endpoint = (!endpoint.trim().is_empty()).then_some(endpoint);
        }
        if let Some(path) = lookup(ENV_SEG_WEIGHTS) {
            self.segmentation.artifact.local_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(ENV_DEPTH_WEIGHTS) {
            let mut artifact = self.depth.resolved_artifact();
            artifact.local_path = Some(PathBuf::from(path));
            self.depth.artifact = Some(artifact);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("confidence_threshold", self.segmentation.confidence_threshold)?;
        check_unit("iou_threshold", self.segmentation.iou_threshold)?;
        check_unit("mask_threshold", self.segmentation.mask_threshold)?;
        check_focal("focal_length_x", self.camera.focal_length_x)?;
        check_focal("focal_length_y", self.camera.focal_length_y)?;

        if self.segmentation.input_size == 0 {
            return Err(ConfigError::InvalidSize {
                name: "segmentation.input_size",
            });
        }
        if self.depth.input_size == 0 {
            return Err(ConfigError::InvalidSize {
                name: "depth.input_size",
            });
        }
        if self.runtime.max_concurrent == 0 {
            return Err(ConfigError::InvalidSize {
                name: "runtime.max_concurrent",
            });
        }
        Ok(())
    }
}

fn check_unit(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidThreshold { name, value });
    }
    Ok(())
}

fn check_focal(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidFocalLength { name, value });
    }
    Ok(())
}
