use std::fmt;

use serde::Serialize;

use crate::emotion::{Emotion, EmotionScores};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
    Unknown,
}

impl Gender {
    pub fn from_label(label: &str) -> Gender {
        match label.trim().to_ascii_lowercase().as_str() {
            "woman" | "female" | "f" | "mujer" => Gender::Female,
            "man" | "male" | "m" | "hombre" => Gender::Male,
            _ => Gender::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Gender::Female => "female",
            Gender::Male => "male",
            Gender::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the analyzer reports for one face in one frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FaceObservation {
    pub gender: Gender,
    pub emotions: EmotionScores,
    pub dominant: Emotion,
    /// Face detector confidence; 0 means the analyzer fell back to the whole frame.
    pub face_confidence: f32,
}

impl FaceObservation {
    /// Observation whose dominant emotion is derived from the scores.
    pub fn new(gender: Gender, emotions: EmotionScores, face_confidence: f32) -> Self {
        let (dominant, _) = emotions.dominant();
        Self {
            gender,
            emotions,
            dominant,
            face_confidence,
        }
    }

    pub fn dominant_score(&self) -> f32 {
        self.emotions[self.dominant]
    }
}
