use chrono::{DateTime, Local};
use serde::Serialize;

use crate::{
    aggregate::{GroupSummary, round_to},
    emotion::{Emotion, EmotionScores},
};

/// One analysis sample as published to live consumers.
///
/// A tick with `face_count == 0` carries no aggregate fields; the JSON form
/// omits them.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupTick {
    pub timestamp: DateTime<Local>,
    pub face_count: usize,
    #[serde(rename = "emotion", skip_serializing_if = "Option::is_none")]
    pub dominant: Option<Emotion>,
    #[serde(rename = "value", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cognitive_load: Option<f32>,
    #[serde(rename = "emotion_values", skip_serializing_if = "Option::is_none")]
    pub medians: Option<EmotionScores>,
}

impl GroupTick {
    pub fn empty(timestamp: DateTime<Local>) -> Self {
        Self {
            timestamp,
            face_count: 0,
            dominant: None,
            confidence: None,
            cognitive_load: None,
            medians: None,
        }
    }

    pub fn from_summary(timestamp: DateTime<Local>, summary: GroupSummary) -> Self {
        Self {
            timestamp,
            face_count: summary.face_count,
            dominant: Some(summary.dominant),
            confidence: Some(round_to(summary.confidence, 2)),
            cognitive_load: Some(summary.cognitive_load),
            medians: Some(summary.medians),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.face_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tick_serializes_face_count_only() {
        let tick = GroupTick::empty(Local::now());
        let json = serde_json::to_value(&tick).unwrap();
        assert_eq!(json["face_count"], 0);
        assert!(json.get("emotion").is_none());
        assert!(json.get("emotion_values").is_none());
    }

    #[test]
    fn populated_tick_uses_live_field_names() {
        let summary = GroupSummary {
            face_count: 2,
            dominant: Emotion::Sad,
            confidence: 80.0,
            medians: EmotionScores::default().with(Emotion::Sad, 80.0),
            cognitive_load: 6.4,
        };
        let json = serde_json::to_value(GroupTick::from_summary(Local::now(), summary)).unwrap();
        assert_eq!(json["face_count"], 2);
        assert_eq!(json["emotion"], "sad");
        assert_eq!(json["value"], 80.0);
        assert_eq!(json["emotion_values"]["sad"], 80.0);
        assert!(json["cognitive_load"].as_f64().is_some());
    }
}
