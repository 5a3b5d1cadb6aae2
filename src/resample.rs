//! Nearest-neighbor resampling of masks and depth maps onto the frame grid.
//!
//! Both go through `image`'s `FilterType::Nearest` on single-channel
//! `Luma` buffers, so every destination value is a copy of a source value.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Pixel, Primitive};
use ndarray::Array2;

use crate::depth::DepthMap;
use crate::segmentation::Mask;

/// Resamples a binary mask to `(height, width)`.
///
/// An empty source yields an all-background mask.
pub fn resize_mask(mask: &Mask, width: usize, height: usize) -> Mask {
    resize_plane(mask, width, height)
}

/// Resamples a depth map to `(height, width)`.
///
/// Float `Luma` samples are clamped to `[0, 1]` by the resizer, so values
/// are scaled by a power of two into that range and back, which is exact.
/// Negative depths come back as zero.
pub fn resize_depth(depth: &DepthMap, width: usize, height: usize) -> DepthMap {
    let peak = depth
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(0.0f32, f32::max);

    let mut scale = 1.0f32;
    while scale < peak {
        scale *= 2.0;
    }

    let unit = depth.mapv(|v| v / scale);
    resize_plane(&unit, width, height).mapv_into(|v| v * scale)
}

fn resize_plane<T>(src: &Array2<T>, width: usize, height: usize) -> Array2<T>
where
    T: Primitive + 'static,
    Luma<T>: Pixel<Subpixel = T> + 'static,
{
    let (rows, cols) = src.dim();
    let raw: Vec<T> = src.iter().copied().collect();

    let Some(buffer) = ImageBuffer::<Luma<T>, Vec<T>>::from_raw(cols as u32, rows as u32, raw) else {
        return Array2::from_elem((height, width), T::DEFAULT_MIN_VALUE);
    };

    let resized = imageops::resize(&buffer, width as u32, height as u32, FilterType::Nearest);
    Array2::from_shape_vec((height, width), resized.into_raw())
        .unwrap_or_else(|_| Array2::from_elem((height, width), T::DEFAULT_MIN_VALUE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn same_size_is_identity() {
        let src = Array2::from_shape_fn((3, 4), |(y, x)| u8::from((y + x) % 2 == 0));
        assert_eq!(resize_mask(&src, 4, 3), src);
    }

    #[test]
    fn upscale_repeats_cells() {
        let src = ndarray::array![[1u8, 0], [0, 1]];
        let dst = resize_mask(&src, 4, 4);
        assert_eq!(
            dst,
            ndarray::array![[1, 1, 0, 0], [1, 1, 0, 0], [0, 0, 1, 1], [0, 0, 1, 1]]
        );
    }

    #[test]
    fn downscale_samples_centers() {
        let src = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as f32);
        let dst = resize_depth(&src, 2, 2);
        // Centers of 2x2 destination land on source cells 1 and 3
        assert_eq!(dst, ndarray::array![[5.0, 7.0], [13.0, 15.0]]);
    }

    #[test]
    fn depth_above_unit_range_is_not_clamped() {
        let src = ndarray::array![[0.25f32, 19.5], [79.99, 3.0]];
        let dst = resize_depth(&src, 4, 4);
        assert_eq!(dst[[0, 3]], 19.5);
        assert_eq!(dst[[3, 0]], 79.99);
        assert_eq!(dst[[3, 3]], 3.0);
    }

    #[test]
    fn empty_source_gives_zeros() {
        let src = Mask::zeros((0, 0));
        let dst = resize_mask(&src, 3, 2);
        assert_eq!(dst.dim(), (2, 3));
        assert!(dst.iter().all(|&v| v == 0));

        let depth = resize_depth(&DepthMap::zeros((0, 5)), 3, 2);
        assert_eq!(depth.dim(), (2, 3));
        assert!(depth.iter().all(|&v| v == 0.0));
    }

    proptest! {
        #[test]
        fn binary_values_preserved(
            bits in prop::collection::vec(0u8..=1, 1..256),
            src_w in 1usize..16,
            width in 1usize..64,
            height in 1usize..64,
        ) {
            let src_h = bits.len().div_ceil(src_w);
            let mut padded = bits.clone();
            padded.resize(src_h * src_w, 0);
            let src = Array2::from_shape_vec((src_h, src_w), padded).unwrap();

            let dst = resize_mask(&src, width, height);
            prop_assert_eq!(dst.dim(), (height, width));
            prop_assert!(dst.iter().all(|&v| v == 0 || v == 1));
        }

        #[test]
        fn depth_values_come_from_source(
            values in prop::collection::vec(0.0f32..80.0, 16),
            width in 1usize..40,
            height in 1usize..40,
        ) {
            let src = Array2::from_shape_vec((4, 4), values.clone()).unwrap();
            let dst = resize_depth(&src, width, height);
            prop_assert!(dst.iter().all(|v| values.contains(v)));
        }
    }
}
