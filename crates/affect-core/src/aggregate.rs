//! Group-level statistics over the engaged faces of one sample.

use crate::{
    emotion::{Emotion, EmotionScores},
    observation::FaceObservation,
};

pub const DEFAULT_ENGAGED_THRESHOLD: f32 = 70.0;

/// Per-emotion weights used to turn a face's distribution into a load score.
///
/// Positive weights raise the load (stress-associated emotions), negative
/// weights lower it, zero is neutral.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CognitiveLoadWeights(EmotionScores);

impl CognitiveLoadWeights {
    pub const fn new(weights: EmotionScores) -> Self {
        Self(weights)
    }

    pub fn weight(&self, emotion: Emotion) -> f32 {
        self.0[emotion]
    }

    pub fn max_weight(&self) -> f32 {
        self.0.values().iter().copied().fold(f32::MIN, f32::max)
    }

    /// Load for a single face, clamped to 0–100.
    pub fn face_load(&self, scores: &EmotionScores) -> f32 {
        let raw: f32 = scores
            .iter()
            .map(|(emotion, value)| (value / 100.0) * self.weight(emotion))
            .sum();
        raw.clamp(0.0, 100.0)
    }

    /// Mean of the per-face loads, rounded to one decimal. Empty input is 0.
    pub fn group_load(&self, faces: &[FaceObservation]) -> f32 {
        if faces.is_empty() {
            return 0.0;
        }
        let total: f32 = faces.iter().map(|face| self.face_load(&face.emotions)).sum();
        round_to(total / faces.len() as f32, 1)
    }
}

impl Default for CognitiveLoadWeights {
    fn default() -> Self {
        Self(EmotionScores::new([
            -3.0, // happy
            8.0,  // sad
            7.0,  // angry
            0.0,  // neutral
            2.0,  // surprise
            6.0,  // fear
            5.0,  // disgust
        ]))
    }
}

/// Aggregate over the engaged faces of one sample.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupSummary {
    pub face_count: usize,
    pub dominant: Emotion,
    pub confidence: f32,
    pub medians: EmotionScores,
    pub cognitive_load: f32,
}

/// Faces whose dominant-emotion score reaches `threshold`.
pub fn engaged_subset(faces: &[FaceObservation], threshold: f32) -> Vec<FaceObservation> {
    faces
        .iter()
        .filter(|face| face.dominant_score() >= threshold)
        .cloned()
        .collect()
}

/// Median of `values`; for an even count the upper of the two middle values.
pub fn upper_median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    Some(values[values.len() / 2])
}

/// Per-emotion medians across `faces`.
pub fn emotion_medians(faces: &[FaceObservation]) -> EmotionScores {
    let mut medians = EmotionScores::default();
    let mut column = Vec::with_capacity(faces.len());
    for emotion in Emotion::ALL {
        column.clear();
        column.extend(faces.iter().map(|face| face.emotions[emotion]));
        medians[emotion] = upper_median(&mut column).unwrap_or(0.0);
    }
    medians
}

/// Summarise the engaged faces. Returns `None` when there are none.
pub fn summarize(faces: &[FaceObservation], weights: &CognitiveLoadWeights) -> Option<GroupSummary> {
    if faces.is_empty() {
        return None;
    }
    let medians = emotion_medians(faces);
    let (dominant, confidence) = medians.dominant();
    Some(GroupSummary {
        face_count: faces.len(),
        dominant,
        confidence,
        medians,
        cognitive_load: weights.group_load(faces),
    })
}

pub(crate) fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::Gender;

    fn face(pairs: &[(Emotion, f32)]) -> FaceObservation {
        let mut scores = EmotionScores::default();
        for &(emotion, value) in pairs {
            scores[emotion] = value;
        }
        FaceObservation::new(Gender::Unknown, scores, 0.95)
    }

    #[test]
    fn calm_faces_have_zero_load() {
        let weights = CognitiveLoadWeights::default();
        let faces = vec![face(&[(Emotion::Happy, 100.0)]); 3];
        assert_eq!(weights.group_load(&faces), 0.0);
        let neutral = vec![face(&[(Emotion::Neutral, 100.0)])];
        assert_eq!(weights.group_load(&neutral), 0.0);
    }

    #[test]
    fn sad_faces_hit_max_weight() {
        let weights = CognitiveLoadWeights::default();
        let faces = vec![face(&[(Emotion::Sad, 100.0)]); 4];
        assert_eq!(weights.group_load(&faces), weights.max_weight());
        assert_eq!(weights.group_load(&faces), 8.0);
    }

    #[test]
    fn face_load_is_clamped() {
        let heavy = CognitiveLoadWeights::new(EmotionScores::new([0.0, 500.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        assert_eq!(heavy.face_load(&face(&[(Emotion::Sad, 100.0)]).emotions), 100.0);
        let weights = CognitiveLoadWeights::default();
        let mixed = face(&[(Emotion::Happy, 90.0), (Emotion::Sad, 10.0)]);
        assert_eq!(weights.face_load(&mixed.emotions), 0.0);
    }

    #[test]
    fn group_load_is_mean_of_face_loads() {
        let weights = CognitiveLoadWeights::default();
        let faces = vec![
            face(&[(Emotion::Sad, 100.0)]),
            face(&[(Emotion::Happy, 100.0)]),
        ];
        assert_eq!(weights.group_load(&faces), 4.0);
    }

    #[test]
    fn upper_median_picks_upper_middle() {
        assert_eq!(upper_median(&mut []), None);
        assert_eq!(upper_median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(upper_median(&mut [4.0, 1.0, 3.0, 2.0]), Some(3.0));
    }

    #[test]
    fn median_resists_single_outlier() {
        let faces = vec![
            face(&[(Emotion::Neutral, 80.0)]),
            face(&[(Emotion::Neutral, 75.0)]),
            face(&[(Emotion::Neutral, 5.0), (Emotion::Angry, 95.0)]),
        ];
        let summary = summarize(&faces, &CognitiveLoadWeights::default()).unwrap();
        assert_eq!(summary.dominant, Emotion::Neutral);
        assert_eq!(summary.confidence, 75.0);
        assert_eq!(summary.medians[Emotion::Angry], 0.0);
    }

    #[test]
    fn tie_break_uses_canonical_order() {
        let weights = CognitiveLoadWeights::default();
        for value in [0.0, 25.0, 70.0, 100.0] {
            let faces = vec![face(&[(Emotion::Disgust, value), (Emotion::Surprise, value)])];
            let summary = summarize(&faces, &weights).unwrap();
            let expected = if value == 0.0 { Emotion::Happy } else { Emotion::Surprise };
            assert_eq!(summary.dominant, expected);
            assert_eq!(summary.confidence, value);
        }
    }

    #[test]
    fn engaged_subset_filters_on_dominant_score() {
        let faces = vec![
            face(&[(Emotion::Sad, 80.0), (Emotion::Happy, 20.0)]),
            face(&[(Emotion::Happy, 69.9)]),
            face(&[(Emotion::Fear, 70.0)]),
        ];
        let engaged = engaged_subset(&faces, DEFAULT_ENGAGED_THRESHOLD);
        assert_eq!(engaged.len(), 2);
        assert_eq!(engaged[0].dominant, Emotion::Sad);
        assert_eq!(engaged[1].dominant, Emotion::Fear);
    }

    #[test]
    fn empty_subset_has_no_summary() {
        assert!(summarize(&[], &CognitiveLoadWeights::default()).is_none());
    }
}
