use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use image::imageops::FilterType;
use ndarray::{s, Array2, Array3, Array4, ArrayView1, Axis};
use ort::session::Session;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::SegmentationConfig;
use crate::frame::Frame;
use crate::labels::ClassNames;
use crate::onnx::{self, LoadFailure};

/// Maximum anchors accepted from model output to prevent DoS
const MAX_MODEL_ANCHORS: usize = 50_000;

/// Maximum candidates entering NMS to bound CPU time
const MAX_NMS_INPUTS: usize = 3_000;

/// Binary instance mask of shape `(height, width)`; foreground is 1.
pub type Mask = Array2<u8>;

/// Mask value selecting an object pixel.
pub const FOREGROUND: u8 = 1;

#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("segmentation weights not found: {path}")]
    MissingWeights { path: String },

    #[error("segmentation model {path} failed to load: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("inference engine error: {0}")]
    Inference(String),

    #[error("invalid model output shape: expected {expected}, got {got}")]
    InvalidOutputShape { expected: String, got: String },

    #[error("session lock poisoned")]
    LockPoisoned,
}

/// Index-aligned per-instance arrays produced for one frame.
///
/// A well-behaved engine returns equal lengths; callers must not rely on it.
#[derive(Debug, Clone, Default)]
pub struct Segmentation {
    /// `[x1, y1, x2, y2]` in original frame pixels
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub class_ids: Vec<u32>,
    /// At the engine's native inference resolution.
    pub masks: Vec<Mask>,
}

impl Segmentation {
    pub fn len(&self) -> usize {
        self.boxes
            .len()
            .min(self.scores.len())
            .min(self.class_ids.len())
            .min(self.masks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Instance segmentation engine.
pub trait Segmenter: Send + Sync {
    fn segment(&self, frame: &Frame) -> Result<Segmentation, SegmentationError>;

    fn class_names(&self) -> &ClassNames;
}

#[derive(Debug, Clone, Copy)]
pub struct SegmenterSettings {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: u32,
    pub mask_threshold: f32,
    pub max_detections: usize,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        (&SegmentationConfig::default()).into()
    }
}

impl From<&SegmentationConfig> for SegmenterSettings {
    fn from(config: &SegmentationConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            input_size: config.input_size,
            mask_threshold: config.mask_threshold,
            max_detections: config.max_detections,
        }
    }
}

/// YOLOv8-seg style ONNX engine.
///
/// # Thread Safety
///
/// Inference is serialized through a mutex around the session, so one
/// instance runs at most one forward pass at a time.
pub struct YoloSegmenter {
    session: Mutex<Session>,
    settings: SegmenterSettings,
    class_names: ClassNames,
}

impl YoloSegmenter {
    /// Loads the model from an ONNX file.
    ///
    /// # Errors
    ///
    /// Returns error if the file is absent or cannot be deserialized.
    #[instrument(skip(settings, class_names), fields(path = %path.display()))]
    pub fn load(
        path: &Path,
        settings: SegmenterSettings,
        class_names: ClassNames,
    ) -> Result<Self, SegmentationError> {
        let session = onnx::open_session(path).map_err(|failure| match failure {
            LoadFailure::Missing => SegmentationError::MissingWeights {
                path: path.display().to_string(),
            },
            LoadFailure::Invalid(reason) => SegmentationError::ModelLoad {
                path: path.display().to_string(),
                reason,
            },
        })?;

        debug!(
            input_size = settings.input_size,
            num_classes = class_names.len(),
            "segmentation model ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            settings,
            class_names,
        })
    }

    /// Stretches the frame to the square model input; no letterbox, so
    /// native masks map linearly onto the frame.
    fn preprocess(&self, frame: &Frame) -> Array4<f32> {
        let size = self.settings.input_size;
        let resized = image::imageops::resize(frame.rgb(), size, size, FilterType::Triangle);
        let side = size as usize;

        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
            }
        }
        tensor
    }

    /// Returns `(predictions [anchors, features], prototypes [k, mh, mw])`.
    fn run_inference(
        &self,
        input: Array4<f32>,
    ) -> Result<(Array2<f32>, Array3<f32>), SegmentationError> {
        let input_value = ort::value::Tensor::from_array(input)
            .map_err(|e| SegmentationError::Inference(onnx::sanitize("segmentation", &e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| SegmentationError::LockPoisoned)?;

        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| SegmentationError::Inference(onnx::sanitize("segmentation", &e)))?;

        let (preds, protos) = match (outputs.get("output0"), outputs.get("output1")) {
            (Some(preds), Some(protos)) => (preds, protos),
            _ if outputs.len() >= 2 => (&outputs[0], &outputs[1]),
            _ => {
                return Err(SegmentationError::Inference(
                    "model missing detection or prototype output".into(),
                ))
            }
        };

        let (pred_shape, pred_data) = preds
            .try_extract_tensor::<f32>()
            .map_err(|e| SegmentationError::Inference(onnx::sanitize("segmentation", &e)))?;
        let (proto_shape, proto_data) = protos
            .try_extract_tensor::<f32>()
            .map_err(|e| SegmentationError::Inference(onnx::sanitize("segmentation", &e)))?;

        let pred_dims = onnx::dims(pred_shape).unwrap_or_default();
        let proto_dims = onnx::dims(proto_shape).unwrap_or_default();
        decode_raw_outputs(&pred_dims, pred_data, &proto_dims, proto_data)
    }
}

impl Segmenter for YoloSegmenter {
    #[instrument(skip(self, frame), fields(width = frame.width(), height = frame.height()))]
    fn segment(&self, frame: &Frame) -> Result<Segmentation, SegmentationError> {
        let start = Instant::now();
        let input = self.preprocess(frame);
        let (preds, protos) = self.run_inference(input)?;
        let inference_ms = start.elapsed().as_secs_f64() * 1000.0;

        let segmentation = postprocess(&preds, &protos, frame.dimensions(), &self.settings)?;
        debug!(
            instances = segmentation.len(),
            inference_ms,
            total_ms = start.elapsed().as_secs_f64() * 1000.0,
            "segmentation completed"
        );
        Ok(segmentation)
    }

    fn class_names(&self) -> &ClassNames {
        &self.class_names
    }
}

/// Normalizes raw output buffers into `[anchors, features]` predictions and
/// `[k, mh, mw]` prototypes.
fn decode_raw_outputs(
    pred_dims: &[usize],
    pred_data: &[f32],
    proto_dims: &[usize],
    proto_data: &[f32],
) -> Result<(Array2<f32>, Array3<f32>), SegmentationError> {
    let shape_err = |expected: &str, got: &[usize]| SegmentationError::InvalidOutputShape {
        expected: expected.into(),
        got: format!("{got:?}"),
    };

    if proto_dims.len() != 4 || proto_dims[0] != 1 {
        return Err(shape_err("[1, k, mh, mw]", proto_dims));
    }
    if proto_dims[1..].contains(&0) {
        return Err(shape_err("non-empty prototypes", proto_dims));
    }
    let protos = Array3::from_shape_vec(
        (proto_dims[1], proto_dims[2], proto_dims[3]),
        proto_data.to_vec(),
    )
    .map_err(|_| shape_err("prototype data matching shape", proto_dims))?;

    if pred_dims.len() != 3 || pred_dims[0] != 1 {
        return Err(shape_err(
            "[1, features, anchors] or [1, anchors, features]",
            pred_dims,
        ));
    }

    // Anchors always outnumber features
    let (features, anchors, transposed) = if pred_dims[1] < pred_dims[2] {
        (pred_dims[1], pred_dims[2], true)
    } else {
        (pred_dims[2], pred_dims[1], false)
    };

    if anchors > MAX_MODEL_ANCHORS {
        return Err(shape_err(&format!("at most {MAX_MODEL_ANCHORS} anchors"), pred_dims));
    }
    if features <= 4 + protos.shape()[0] {
        return Err(shape_err("4 box + classes + mask coefficients", pred_dims));
    }

    let preds = if transposed {
        Array2::from_shape_vec((features, anchors), pred_data.to_vec())
            .map_err(|_| shape_err("prediction data matching shape", pred_dims))?
            .reversed_axes()
            .as_standard_layout()
            .to_owned()
    } else {
        Array2::from_shape_vec((anchors, features), pred_data.to_vec())
            .map_err(|_| shape_err("prediction data matching shape", pred_dims))?
    };

    Ok((preds, protos))
}

#[derive(Debug, Clone)]
struct Candidate {
    /// Model-input pixel space
    bbox: [f32; 4],
    score: f32,
    class_id: u32,
    coeffs: Vec<f32>,
}

/// Turns `[anchors, 4 + classes + k]` predictions and `[k, mh, mw]`
/// prototypes into a segmentation of a `frame_size` frame.
fn postprocess(
    preds: &Array2<f32>,
    protos: &Array3<f32>,
    frame_size: (u32, u32),
    settings: &SegmenterSettings,
) -> Result<Segmentation, SegmentationError> {
    let (num_coeffs, proto_h, proto_w) = protos.dim();
    if num_coeffs == 0 || proto_h == 0 || proto_w == 0 {
        return Err(SegmentationError::InvalidOutputShape {
            expected: "non-empty prototypes".into(),
            got: format!("{:?}", protos.shape()),
        });
    }
    let features = preds.shape()[1];
    if features <= 4 + num_coeffs {
        return Err(SegmentationError::InvalidOutputShape {
            expected: format!("more than {} features", 4 + num_coeffs),
            got: features.to_string(),
        });
    }
    let num_classes = features - 4 - num_coeffs;
    let input = settings.input_size as f32;

    let mut candidates = Vec::new();
    for row in preds.axis_iter(Axis(0)) {
        if let Some(candidate) = decode_row(row, num_classes, input, settings.confidence_threshold)
        {
            candidates.push(candidate);
        }
    }

    let candidates_before_nms = candidates.len();
    candidates.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
    let (mut kept, truncated) = nms_with_tracking(candidates, settings.iou_threshold);
    kept.truncate(settings.max_detections);

    debug!(
        candidates_before_nms,
        kept = kept.len(),
        truncated,
        "segmentation postprocess"
    );

    let (frame_w, frame_h) = frame_size;
    let scale_x = frame_w as f32 / input;
    let scale_y = frame_h as f32 / input;

    let mut out = Segmentation::default();
    for candidate in kept {
        let mask = assemble_mask(&candidate, protos, settings);
        let [x1, y1, x2, y2] = candidate.bbox;
        out.boxes.push([
            (x1 * scale_x).clamp(0.0, frame_w as f32),
            (y1 * scale_y).clamp(0.0, frame_h as f32),
            (x2 * scale_x).clamp(0.0, frame_w as f32),
            (y2 * scale_y).clamp(0.0, frame_h as f32),
        ]);
        out.scores.push(candidate.score);
        out.class_ids.push(candidate.class_id);
        out.masks.push(mask);
    }
    Ok(out)
}

fn decode_row(
    row: ArrayView1<f32>,
    num_classes: usize,
    input: f32,
    conf_threshold: f32,
) -> Option<Candidate> {
    let (best_cls_idx, max_score) = row
        .iter()
        .skip(4)
        .take(num_classes)
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |(best_idx, best_score), (idx, &score)| {
            if score > best_score {
                (idx, score)
            } else {
                (best_idx, best_score)
            }
        });

    if !max_score.is_finite() || max_score < conf_threshold {
        return None;
    }

    let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
    if !cx.is_finite() || !cy.is_finite() || !w.is_finite() || !h.is_finite() {
        return None;
    }
    if w <= 0.0 || h <= 0.0 {
        return None;
    }

    let bbox = [
        (cx - w / 2.0).clamp(0.0, input),
        (cy - h / 2.0).clamp(0.0, input),
        (cx + w / 2.0).clamp(0.0, input),
        (cy + h / 2.0).clamp(0.0, input),
    ];
    if bbox[2] - bbox[0] < 1.0 || bbox[3] - bbox[1] < 1.0 {
        return None;
    }

    Some(Candidate {
        bbox,
        score: max_score,
        class_id: best_cls_idx as u32,
        coeffs: row.iter().skip(4 + num_classes).copied().collect(),
    })
}

/// Linear combination of prototypes, sigmoid, cropped to the box and
/// thresholded at the square model input resolution.
fn assemble_mask(candidate: &Candidate, protos: &Array3<f32>, settings: &SegmenterSettings) -> Mask {
    let (k, mh, mw) = protos.dim();
    let side = settings.input_size as usize;

    let mut logits = Array2::<f32>::zeros((mh, mw));
    for (c, &coeff) in candidate.coeffs.iter().take(k).enumerate() {
        logits.scaled_add(coeff, &protos.slice(s![c, .., ..]));
    }
    let low_res = logits.mapv(|v| sigmoid(v) > settings.mask_threshold);

    let [x1, y1, x2, y2] = candidate.bbox;
    Mask::from_shape_fn((side, side), |(y, x)| {
        let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);
        if fx < x1 || fx > x2 || fy < y1 || fy > y2 {
            return 0;
        }
        let py = (y * mh / side).min(mh - 1);
        let px = (x * mw / side).min(mw - 1);
        u8::from(low_res[[py, px]])
    })
}

/// Class-agnostic non-maximum suppression over score-sorted candidates.
///
/// Returns the survivors and whether the input was cut to `MAX_NMS_INPUTS`.
fn nms_with_tracking(mut candidates: Vec<Candidate>, iou_threshold: f32) -> (Vec<Candidate>, bool) {
    let truncated = candidates.len() > MAX_NMS_INPUTS;
    if truncated {
        warn!(
            original = candidates.len(),
            limit = MAX_NMS_INPUTS,
            "NMS input truncated"
        );
        candidates.truncate(MAX_NMS_INPUTS);
    }

    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len().min(100));
    for candidate in candidates {
        if kept.iter().all(|k| iou(&k.bbox, &candidate.bbox) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    (kept, truncated)
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    // Disjoint boxes
    if b[0] > a[2] || b[2] < a[0] || b[1] > a[3] || b[3] < a[1] {
        return 0.0;
    }
    let inter = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0) * (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let union = (a[2] - a[0]) * (a[3] - a[1]) + (b[2] - b[0]) * (b[3] - b[1]) - inter;
    if union > f32::EPSILON {
        inter / union
    } else {
        0.0
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(bbox: [f32; 4], score: f32) -> Candidate {
        Candidate {
            bbox,
            score,
            class_id: 0,
            coeffs: vec![],
        }
    }

    fn settings(input_size: u32) -> SegmenterSettings {
        SegmenterSettings {
            input_size,
            ..SegmenterSettings::default()
        }
    }

    /// One anchor row: box, class scores, mask coefficients.
    fn row(bbox_cxcywh: [f32; 4], class_scores: &[f32], coeffs: &[f32]) -> Vec<f32> {
        bbox_cxcywh
            .iter()
            .chain(class_scores)
            .chain(coeffs)
            .copied()
            .collect()
    }

    #[test]
    fn nms_empty() {
        let (result, truncated) = nms_with_tracking(vec![], 0.5);
        assert!(result.is_empty());
        assert!(!truncated);
    }

    #[test]
    fn nms_overlapping_keeps_highest() {
        let a = candidate([10.0, 10.0, 50.0, 50.0], 0.9);
        let b = candidate([12.0, 12.0, 52.0, 52.0], 0.8);
        let (result, _) = nms_with_tracking(vec![a, b], 0.7);
        assert_eq!(result.len(), 1);
        assert!((result[0].score - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn nms_non_overlapping_keeps_order() {
        let a = candidate([0.0, 0.0, 20.0, 20.0], 0.9);
        let b = candidate([80.0, 80.0, 100.0, 100.0], 0.8);
        let (result, _) = nms_with_tracking(vec![a, b], 0.7);
        assert_eq!(result.len(), 2);
        assert!(result[0].score > result[1].score);
    }

    #[test]
    fn nms_moderate_overlap_below_threshold_kept() {
        // IoU = 400 / 2800 ~ 0.14
        let a = candidate([0.0, 0.0, 40.0, 40.0], 0.9);
        let b = candidate([20.0, 20.0, 60.0, 60.0], 0.8);
        let (result, _) = nms_with_tracking(vec![a, b], 0.7);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn iou_identical_and_disjoint() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        // Half overlap: 50 / 150
        assert!((iou(&a, &[5.0, 0.0, 15.0, 10.0]) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn sigmoid_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < f32::EPSILON);
        assert!(sigmoid(10.0) > 0.99);
    }

    #[test]
    fn decode_transposed_output() {
        // [1, features=6, anchors=8] with one prototype channel
        let pred_dims = [1, 6, 8];
        let pred: Vec<f32> = (0..48).map(|v| v as f32).collect();
        let proto_dims = [1, 1, 2, 2];
        let proto = vec![0.0; 4];

        let (preds, protos) = decode_raw_outputs(&pred_dims, &pred, &proto_dims, &proto).unwrap();
        assert_eq!(preds.dim(), (8, 6));
        assert_eq!(protos.dim(), (1, 2, 2));
        // Row 1, feature 2 came from pred[2 * 8 + 1]
        assert!((preds[[1, 2]] - 17.0).abs() < f32::EPSILON);
    }

    #[test]
    fn decode_rejects_bad_prototype_rank() {
        let result = decode_raw_outputs(&[1, 6, 8], &[0.0; 48], &[1, 4], &[0.0; 4]);
        assert!(matches!(result, Err(SegmentationError::InvalidOutputShape { .. })));
    }

    #[test]
    fn decode_rejects_empty_prototypes() {
        for proto_dims in [[1, 1, 0, 0], [1, 32, 0, 160], [1, 32, 160, 0], [1, 0, 160, 160]] {
            let result = decode_raw_outputs(&[1, 6, 8], &[0.0; 48], &proto_dims, &[]);
            assert!(
                matches!(result, Err(SegmentationError::InvalidOutputShape { .. })),
                "{proto_dims:?} accepted"
            );
        }
    }

    #[test]
    fn postprocess_rejects_empty_prototypes() {
        let rows = [row([32.0, 32.0, 16.0, 16.0], &[0.95], &[5.0])];
        let preds = Array2::from_shape_vec((1, 6), rows.concat()).unwrap();
        let protos = Array3::<f32>::zeros((1, 0, 0));

        let result = postprocess(&preds, &protos, (64, 64), &settings(64));
        assert!(matches!(result, Err(SegmentationError::InvalidOutputShape { .. })));
    }

    #[test]
    fn postprocess_filters_low_confidence_and_scales_boxes() {
        // 2 classes, 1 mask coefficient; prototypes all strongly positive
        let rows = [
            row([16.0, 16.0, 16.0, 16.0], &[0.1, 0.9], &[10.0]),
            row([48.0, 48.0, 8.0, 8.0], &[0.1, 0.2], &[10.0]),
        ];
        let preds = Array2::from_shape_vec((2, 7), rows.concat()).unwrap();
        let protos = Array3::from_elem((1, 8, 8), 1.0);

        let seg = postprocess(&preds, &protos, (128, 64), &settings(64)).unwrap();

        assert_eq!(seg.len(), 1);
        assert_eq!(seg.class_ids, vec![1]);
        assert!((seg.scores[0] - 0.9).abs() < f32::EPSILON);
        // Input box [8, 8, 24, 24] scaled by (2, 1)
        assert_eq!(seg.boxes[0], [16.0, 8.0, 48.0, 24.0]);
        assert_eq!(seg.masks[0].dim(), (64, 64));
    }

    #[test]
    fn mask_is_binary_and_cropped_to_box() {
        let rows = [row([32.0, 32.0, 16.0, 16.0], &[0.95], &[5.0])];
        let preds = Array2::from_shape_vec((1, 6), rows.concat()).unwrap();
        let protos = Array3::from_elem((1, 16, 16), 1.0);

        let seg = postprocess(&preds, &protos, (64, 64), &settings(64)).unwrap();
        let mask = &seg.masks[0];

        assert!(mask.iter().all(|&v| v == 0 || v == FOREGROUND));
        assert_eq!(mask[[32, 32]], FOREGROUND);
        assert_eq!(mask[[2, 2]], 0);
        let area = mask.iter().filter(|&&v| v == FOREGROUND).count();
        assert_eq!(area, 16 * 16);
    }

    #[test]
    fn negative_prototype_response_yields_empty_mask() {
        let rows = [row([32.0, 32.0, 16.0, 16.0], &[0.95], &[-5.0])];
        let preds = Array2::from_shape_vec((1, 6), rows.concat()).unwrap();
        let protos = Array3::from_elem((1, 16, 16), 1.0);

        let seg = postprocess(&preds, &protos, (64, 64), &settings(64)).unwrap();
        assert_eq!(seg.len(), 1);
        assert!(seg.masks[0].iter().all(|&v| v == 0));
    }

    #[test]
    fn overlapping_instances_suppressed() {
        let rows = [
            row([32.0, 32.0, 20.0, 20.0], &[0.8], &[1.0]),
            row([33.0, 33.0, 20.0, 20.0], &[0.9], &[1.0]),
        ];
        let preds = Array2::from_shape_vec((2, 6), rows.concat()).unwrap();
        let protos = Array3::from_elem((1, 4, 4), 1.0);

        let seg = postprocess(&preds, &protos, (64, 64), &settings(64)).unwrap();
        assert_eq!(seg.len(), 1);
        assert!((seg.scores[0] - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn nan_rows_skipped() {
        let rows = [row([f32::NAN, 32.0, 20.0, 20.0], &[0.9], &[1.0])];
        let preds = Array2::from_shape_vec((1, 6), rows.concat()).unwrap();
        let protos = Array3::from_elem((1, 4, 4), 1.0);

        let seg = postprocess(&preds, &protos, (64, 64), &settings(64)).unwrap();
        assert!(seg.is_empty());
    }

    #[test]
    fn segmentation_len_is_shortest_array() {
        let seg = Segmentation {
            boxes: vec![[0.0; 4]; 5],
            scores: vec![0.5; 5],
            class_ids: vec![1; 4],
            masks: vec![Mask::zeros((2, 2)); 3],
        };
        assert_eq!(seg.len(), 3);
    }

    #[test]
    fn load_missing_weights_is_reported() {
        let result = YoloSegmenter::load(
            Path::new("/nonexistent/yolo.onnx"),
            SegmenterSettings::default(),
            ClassNames::default(),
        );
        assert!(matches!(result, Err(SegmentationError::MissingWeights { .. })));
    }
}
