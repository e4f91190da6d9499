//! Inference seam: anything that turns a frame into face observations.

use thiserror::Error;
use video_ingest::Frame;

use crate::observation::FaceObservation;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// No model is loaded or the runtime is missing.
    #[error("emotion inference is not available")]
    Unavailable,
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

impl AnalyzerError {
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }
}

/// Per-frame face/emotion inference.
///
/// Implementations must be callable even when the model is missing and report
/// that as [`AnalyzerError::Unavailable`].
pub trait EmotionAnalyzer: Send {
    fn analyze(&mut self, frame: &Frame) -> Result<Vec<FaceObservation>, AnalyzerError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Analyzer used when no model is wired in.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnavailableAnalyzer;

impl EmotionAnalyzer for UnavailableAnalyzer {
    fn analyze(&mut self, _frame: &Frame) -> Result<Vec<FaceObservation>, AnalyzerError> {
        Err(AnalyzerError::Unavailable)
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

impl<A: EmotionAnalyzer + ?Sized> EmotionAnalyzer for Box<A> {
    fn analyze(&mut self, frame: &Frame) -> Result<Vec<FaceObservation>, AnalyzerError> {
        (**self).analyze(frame)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
