//! Emotion model shared by the analysis loop and its consumers.
//!
//! - `emotion`: the canonical seven-label set and per-emotion score arrays.
//! - `observation`: per-face analyzer output.
//! - `analyzer`: the inference seam.
//! - `aggregate`: engaged-face filtering, medians, cognitive load.
//! - `tick`: the published group sample.

pub mod aggregate;
pub mod analyzer;
pub mod emotion;
pub mod observation;
pub mod tick;

pub use aggregate::{
    CognitiveLoadWeights, DEFAULT_ENGAGED_THRESHOLD, GroupSummary, engaged_subset, summarize,
};
pub use analyzer::{AnalyzerError, EmotionAnalyzer, UnavailableAnalyzer};
pub use emotion::{Emotion, EmotionScores};
pub use observation::{FaceObservation, Gender};
pub use tick::GroupTick;
