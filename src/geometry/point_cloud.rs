use ndarray::Array2;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::hull::{ConvexHull, HullError, Point3};
use crate::config::{CameraConfig, DEFAULT_FOCAL_LENGTH};
use crate::segmentation::{Mask, FOREGROUND};

/// Minimum point count for a hull with volume.
const MIN_HULL_POINTS: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("{name} must be {expected:?} (height, width), got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize),
        got: (usize, usize),
    },
}

/// Pinhole intrinsics in pixels; the principal point is the image center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub focal_length_x: f64,
    pub focal_length_y: f64,
}

impl CameraIntrinsics {
    pub fn new(focal_length_x: f64, focal_length_y: f64) -> Self {
        Self {
            focal_length_x,
            focal_length_y,
        }
    }
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self::new(DEFAULT_FOCAL_LENGTH, DEFAULT_FOCAL_LENGTH)
    }
}

impl From<CameraConfig> for CameraIntrinsics {
    fn from(config: CameraConfig) -> Self {
        Self::new(config.focal_length_x, config.focal_length_y)
    }
}

/// One camera-space point per pixel, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    width: usize,
    height: usize,
    points: Vec<[f32; 3]>,
}

impl PointCloud {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn points(&self) -> &[[f32; 3]] {
        &self.points
    }

    /// Point back-projected from pixel `(x, y)`.
    pub fn at(&self, x: usize, y: usize) -> Option<[f32; 3]> {
        (x < self.width && y < self.height).then(|| self.points[y * self.width + x])
    }

    /// Points whose mask value is foreground.
    pub fn select(&self, mask: &Mask) -> Vec<Point3> {
        self.points
            .iter()
            .zip(mask.iter())
            .filter(|(_, &m)| m == FOREGROUND)
            .map(|(p, _)| p.map(f64::from))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PointCloudReconstructor {
    intrinsics: CameraIntrinsics,
}

impl PointCloudReconstructor {
    pub fn new(intrinsics: CameraIntrinsics) -> Self {
        Self { intrinsics }
    }

    pub fn intrinsics(&self) -> CameraIntrinsics {
        self.intrinsics
    }

    /// Back-projects every pixel of a `(height, width)` depth map.
    ///
    /// Deterministic: identical inputs give identical points in the same order.
    pub fn back_project(
        &self,
        width: usize,
        height: usize,
        depth: &Array2<f32>,
    ) -> Result<PointCloud, GeometryError> {
        check_shape("depth map", width, height, depth.dim())?;

        let cx = width as f64 / 2.0;
        let cy = height as f64 / 2.0;
        let CameraIntrinsics {
            focal_length_x: fx,
            focal_length_y: fy,
        } = self.intrinsics;

        let points = depth
            .indexed_iter()
            .map(|((y, x), &z)| {
                let z = f64::from(z);
                let xn = (x as f64 - cx) / fx;
                let yn = (y as f64 - cy) / fy;
                [(xn * z) as f32, (yn * z) as f32, z as f32]
            })
            .collect();

        Ok(PointCloud {
            width,
            height,
            points,
        })
    }

    /// Convex-hull volume per mask, in mask order.
    ///
    /// Masks selecting fewer than 4 points, or points without 3D extent,
    /// get 0.0.
    ///
    /// # Errors
    ///
    /// Returns error if the depth map or any mask is not `(height, width)`.
    #[instrument(skip(self, depth, masks), fields(masks = masks.len()))]
    pub fn volumes(
        &self,
        width: usize,
        height: usize,
        depth: &Array2<f32>,
        masks: &[Mask],
    ) -> Result<Vec<f64>, GeometryError> {
        for (i, mask) in masks.iter().enumerate() {
            check_shape(&format!("mask {i}"), width, height, mask.dim())?;
        }
        let cloud = self.back_project(width, height, depth)?;

        let results: Vec<(f64, bool)> = masks
            .par_iter()
            .map(|mask| instance_volume(&cloud.select(mask)))
            .collect();

        let degenerate = results.iter().filter(|(_, degenerate)| *degenerate).count();
        if degenerate > 0 {
            warn!(degenerate, total = masks.len(), "degenerate instances assigned zero volume");
        }
        debug!(points = cloud.points.len(), "volumes reconstructed");

        Ok(results.into_iter().map(|(volume, _)| volume).collect())
    }

    /// Metric footprint of a mask: sum over foreground pixels of
    /// `(Z / fx) * (Z / fy)`.
    pub fn projected_area(
        &self,
        width: usize,
        height: usize,
        depth: &Array2<f32>,
        mask: &Mask,
    ) -> Result<f64, GeometryError> {
        check_shape("depth map", width, height, depth.dim())?;
        check_shape("mask", width, height, mask.dim())?;

        let CameraIntrinsics {
            focal_length_x: fx,
            focal_length_y: fy,
        } = self.intrinsics;

        Ok(depth
            .iter()
            .zip(mask.iter())
            .filter(|(_, &m)| m == FOREGROUND)
            .map(|(&z, _)| {
                let z = f64::from(z);
                (z / fx) * (z / fy)
            })
            .sum())
    }
}

/// Returns `(volume, degenerate)`; the hull is never attempted below 4 points.
fn instance_volume(points: &[Point3]) -> (f64, bool) {
    if points.len() < MIN_HULL_POINTS {
        return (0.0, true);
    }
    match ConvexHull::build(points) {
        Ok(hull) => (hull.volume(), false),
        Err(HullError::Degenerate | HullError::TooFewPoints(_)) => (0.0, true),
    }
}

fn check_shape(
    name: &str,
    width: usize,
    height: usize,
    got: (usize, usize),
) -> Result<(), GeometryError> {
    if got != (height, width) {
        return Err(GeometryError::ShapeMismatch {
            name: name.to_string(),
            expected: (height, width),
            got,
        });
    }
    Ok(())
}
