//! Camera back-projection and per-instance volume reconstruction.

mod hull;
mod point_cloud;

pub use hull::{convex_hull_volume, ConvexHull, HullError, Point3};
pub use point_cloud::{CameraIntrinsics, GeometryError, PointCloud, PointCloudReconstructor};
