//! Zip-to-shortest alignment of per-instance model outputs.

use tracing::warn;

use crate::segmentation::{Mask, Segmentation};

/// One instance with an entry in every per-instance array.
#[derive(Debug, Clone)]
pub struct AlignedInstance {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: u32,
    pub mask: Mask,
    pub volume: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Alignment {
    pub instances: Vec<AlignedInstance>,
    /// Entries of the longest array beyond the shortest one.
    pub dropped: usize,
}

/// Zips segmentation arrays and volumes, truncating to the shortest.
///
/// Order is preserved; a mismatch is logged with every length.
pub fn zip_to_shortest(segmentation: Segmentation, volumes: Vec<f64>) -> Alignment {
    let lengths = [
        segmentation.boxes.len(),
        volumes.len(),
        segmentation.scores.len(),
        segmentation.class_ids.len(),
        segmentation.masks.len(),
    ];
    let n = lengths.iter().copied().min().unwrap_or(0);
    let longest = lengths.iter().copied().max().unwrap_or(0);
    let dropped = longest - n;

    if dropped > 0 {
        warn!(
            boxes = lengths[0],
            volumes = lengths[1],
            scores = lengths[2],
            class_ids = lengths[3],
            masks = lengths[4],
            kept = n,
            dropped,
            "per-instance outputs disagree in length, truncating"
        );
    }

    let instances = segmentation
        .boxes
        .into_iter()
        .zip(volumes)
        .zip(segmentation.scores)
        .zip(segmentation.class_ids)
        .zip(segmentation.masks)
        .map(|((((bbox, volume), score), class_id), mask)| AlignedInstance {
            bbox,
            score,
            class_id,
            mask,
            volume,
        })
        .collect();

    Alignment { instances, dropped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmentation(boxes: usize, scores: usize, class_ids: usize, masks: usize) -> Segmentation {
        Segmentation {
            boxes: (0..boxes).map(|i| [i as f32, 0.0, i as f32 + 1.0, 1.0]).collect(),
            scores: (0..scores).map(|i| 1.0 - i as f32 * 0.1).collect(),
            class_ids: (0..class_ids).map(|i| i as u32).collect(),
            masks: vec![Mask::zeros((2, 2)); masks],
        }
    }

    #[test]
    fn equal_lengths_keep_everything_in_order() {
        let alignment = zip_to_shortest(segmentation(3, 3, 3, 3), vec![0.1, 0.2, 0.3]);
        assert_eq!(alignment.dropped, 0);
        assert_eq!(alignment.instances.len(), 3);
        for (i, instance) in alignment.instances.iter().enumerate() {
            assert_eq!(instance.class_id, i as u32);
            assert!((instance.bbox[0] - i as f32).abs() < f32::EPSILON);
        }
        assert!((alignment.instances[2].volume - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn five_boxes_three_masks_gives_three() {
        let alignment = zip_to_shortest(segmentation(5, 5, 5, 3), vec![1.0; 3]);
        assert_eq!(alignment.instances.len(), 3);
        assert_eq!(alignment.dropped, 2);
    }

    #[test]
    fn shortest_array_wins_whichever_it_is() {
        assert_eq!(zip_to_shortest(segmentation(4, 2, 4, 4), vec![1.0; 4]).instances.len(), 2);
        assert_eq!(zip_to_shortest(segmentation(4, 4, 1, 4), vec![1.0; 4]).instances.len(), 1);
        assert_eq!(zip_to_shortest(segmentation(4, 4, 4, 4), vec![]).instances.len(), 0);
    }

    #[test]
    fn empty_inputs() {
        let alignment = zip_to_shortest(Segmentation::default(), vec![]);
        assert!(alignment.instances.is_empty());
        assert_eq!(alignment.dropped, 0);
    }
}
