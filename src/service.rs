use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::config::RuntimeConfig;
use crate::depth::DepthEstimator;
use crate::frame::ImageInput;
use crate::pipeline::{PipelineError, PredictionReport, VolumePredictor};
use crate::segmentation::Segmenter;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("service overloaded, try again later")]
    Overloaded,

    #[error("prediction deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("prediction task failed to complete")]
    Join,
}

/// Async front end for a shared predictor.
///
/// Rejects instead of queueing once `max_concurrent` calls are in flight.
/// An expired deadline abandons the result; the blocking call still runs
/// to completion on its worker thread.
pub struct VolumeService<S, D> {
    predictor: Arc<VolumePredictor<S, D>>,
    semaphore: Arc<Semaphore>,
    deadline: Option<Duration>,
}

impl<S, D> Clone for VolumeService<S, D> {
    fn clone(&self) -> Self {
        Self {
            predictor: Arc::clone(&self.predictor),
            semaphore: Arc::clone(&self.semaphore),
            deadline: self.deadline,
        }
    }
}

impl<S, D> VolumeService<S, D>
where
    S: Segmenter + 'static,
    D: DepthEstimator + 'static,
{
    pub fn new(predictor: Arc<VolumePredictor<S, D>>, runtime: &RuntimeConfig) -> Self {
        Self {
            predictor,
            semaphore: Arc::new(Semaphore::new(runtime.max_concurrent.max(1))),
            deadline: runtime.deadline_ms.map(Duration::from_millis),
        }
    }

    pub fn predictor(&self) -> &Arc<VolumePredictor<S, D>> {
        &self.predictor
    }

    #[instrument(skip(self, input))]
    pub async fn predict(&self, input: ImageInput) -> Result<PredictionReport, ServiceError> {
        let start = Instant::now();
        counter!("volume.predict.requests").increment(1);

        let _permit = self.semaphore.try_acquire().map_err(|_| {
            counter!("volume.predict.rejected").increment(1);
            ServiceError::Overloaded
        })?;

        let predictor = Arc::clone(&self.predictor);
        let task = tokio::task::spawn_blocking(move || predictor.predict_with_report(input));

        let joined = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, task).await.map_err(|_| {
                counter!("volume.predict.deadline_exceeded").increment(1);
                ServiceError::DeadlineExceeded(deadline)
            })?,
            None => task.await,
        };
        let result = joined.map_err(|_| ServiceError::Join)?;

        histogram!("volume.predict.duration_ms").record(start.elapsed().as_millis() as f64);

        match &result {
            Ok(report) => {
                histogram!("volume.predict.instances").record(report.predictions.len() as f64);
                if report.dropped > 0 {
                    counter!("volume.predict.dropped_instances").increment(report.dropped as u64);
                }
            }
            Err(e) => {
                counter!("volume.predict.errors").increment(1);
                warn!(error = %e, kind = ?e.kind(), "prediction failed");
            }
        }

        result.map_err(ServiceError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::{DepthError, DepthMap};
    use crate::frame::Frame;
    use crate::geometry::CameraIntrinsics;
    use crate::labels::ClassNames;
    use crate::segmentation::{Mask, Segmentation, SegmentationError};
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    struct SingleBlob {
        names: ClassNames,
        delay: Duration,
    }

    impl Segmenter for SingleBlob {
        fn segment(&self, frame: &Frame) -> Result<Segmentation, SegmentationError> {
            std::thread::sleep(self.delay);
            let (w, h) = (frame.width() as usize, frame.height() as usize);
            Ok(Segmentation {
                boxes: vec![[0.0, 0.0, w as f32, h as f32]],
                scores: vec![0.9],
                class_ids: vec![66],
                masks: vec![Mask::from_elem((h, w), 1)],
            })
        }

        fn class_names(&self) -> &ClassNames {
            &self.names
        }
    }

    struct Ramp;

    impl DepthEstimator for Ramp {
        fn estimate(&self, frame: &Frame) -> Result<DepthMap, DepthError> {
            let (w, h) = (frame.width() as usize, frame.height() as usize);
            Ok(DepthMap::from_shape_fn((h, w), |(y, x)| {
                1.0 + ((x * 3 + y * 5) % 7) as f32 * 0.05
            }))
        }
    }

    fn service(delay: Duration, runtime: RuntimeConfig) -> VolumeService<SingleBlob, Ramp> {
        let predictor = VolumePredictor::new(
            SingleBlob {
                names: ClassNames::foodseg103(),
                delay,
            },
            Ramp,
            CameraIntrinsics::default(),
            &runtime,
        );
        VolumeService::new(Arc::new(predictor), &runtime)
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([120, 80, 40]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn predicts_through_blocking_pool() {
        let service = service(Duration::ZERO, RuntimeConfig::default());
        let report = service.predict(ImageInput::Bytes(png(24, 16))).await.unwrap();

        assert_eq!(report.predictions.len(), 1);
        assert_eq!(report.predictions[0].object_name, "rice");
        assert!(report.predictions[0].volume > 0.0);
        assert_eq!(report.dropped, 0);
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let runtime = RuntimeConfig {
            max_concurrent: 1,
            ..RuntimeConfig::default()
        };
        let service = service(Duration::ZERO, runtime);

        let _permit = service.semaphore.try_acquire().unwrap();
        let result = service.predict(ImageInput::Bytes(png(8, 8))).await;

        assert!(matches!(result, Err(ServiceError::Overloaded)));
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let runtime = RuntimeConfig {
            deadline_ms: Some(10),
            ..RuntimeConfig::default()
        };
        let service = service(Duration::from_millis(500), runtime);

        let result = service.predict(ImageInput::Bytes(png(8, 8))).await;
        assert!(matches!(result, Err(ServiceError::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn decode_failure_surfaces_as_pipeline_error() {
        let service = service(Duration::ZERO, RuntimeConfig::default());
        let result = service.predict(ImageInput::Bytes(b"not an image".to_vec())).await;

        match result {
            Err(ServiceError::Pipeline(e)) => {
                assert_eq!(e.kind(), crate::pipeline::ErrorKind::Input);
            }
            other => panic!("expected pipeline error, got {other:?}"),
        }
    }
}
