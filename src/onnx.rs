use std::path::Path;

use ort::session::Session;
use tracing::{debug, info};

/// Opens an ONNX Runtime session, distinguishing a missing file from a
/// file that fails to deserialize.
pub(crate) fn open_session(path: &Path) -> Result<Session, LoadFailure> {
    if !path.is_file() {
        return Err(LoadFailure::Missing);
    }

    info!(path = %path.display(), "loading ONNX model");
    let session = Session::builder()
        .map_err(|e| LoadFailure::Invalid(format!("failed to create session builder: {e}")))?
        .commit_from_file(path)
        .map_err(|e| LoadFailure::Invalid(format!("failed to load model: {e}")))?;

    debug!(path = %path.display(), "model loaded");
    Ok(session)
}

#[derive(Debug)]
pub(crate) enum LoadFailure {
    Missing,
    Invalid(String),
}

/// Logs the full backend error and returns a sanitized message.
pub(crate) fn sanitize(stage: &'static str, e: &ort::Error) -> String {
    tracing::error!(error = %e, stage, "ORT inference error");
    format!("{stage}: internal inference error")
}

/// Converts a dynamic `[i64]` tensor shape to `usize`, rejecting negatives.
pub(crate) fn dims(shape: &[i64]) -> Option<Vec<usize>> {
    shape.iter().map(|&d| usize::try_from(d).ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_file_is_reported_as_missing() {
        let result = open_session(Path::new("/nonexistent/model.onnx"));
        assert!(matches!(result, Err(LoadFailure::Missing)));
    }

    #[test]
    fn corrupt_model_file_is_reported_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.onnx");
        std::fs::write(&path, b"not a protobuf").unwrap();
        assert!(matches!(open_session(&path), Err(LoadFailure::Invalid(_))));
    }

    #[test]
    fn negative_dims_rejected() {
        assert_eq!(dims(&[1, 3, 640, 640]), Some(vec![1, 3, 640, 640]));
        assert_eq!(dims(&[1, -1, 640]), None);
    }
}
