use std::{
    fmt,
    ops::{Index, IndexMut},
};

use serde::{Serialize, Serializer, ser::SerializeMap};

/// Canonical emotion labels, in the order every aggregate uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Neutral,
    Surprise,
    Fear,
    Disgust,
}

impl Emotion {
    pub const COUNT: usize = 7;

    pub const ALL: [Emotion; Emotion::COUNT] = [
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Neutral,
        Emotion::Surprise,
        Emotion::Fear,
        Emotion::Disgust,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Neutral => "neutral",
            Emotion::Surprise => "surprise",
            Emotion::Fear => "fear",
            Emotion::Disgust => "disgust",
        }
    }

    /// Translate a model label into the canonical set.
    ///
    /// Accepts the usual model outputs plus the Spanish labels older exports
    /// were written with.
    pub fn from_label(label: &str) -> Option<Emotion> {
        let normalized = label.trim().to_ascii_lowercase();
        let emotion = match normalized.as_str() {
            "happy" | "happiness" | "joy" | "feliz" => Emotion::Happy,
            "sad" | "sadness" | "triste" => Emotion::Sad,
            "angry" | "anger" | "enojado" => Emotion::Angry,
            "neutral" => Emotion::Neutral,
            "surprise" | "surprised" | "sorpresa" => Emotion::Surprise,
            "fear" | "fearful" | "scared" | "miedo" => Emotion::Fear,
            "disgust" | "disgusted" | "asco" => Emotion::Disgust,
            _ => return None,
        };
        Some(emotion)
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One value per canonical emotion, 0–100.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EmotionScores([f32; Emotion::COUNT]);

impl EmotionScores {
    pub const fn new(values: [f32; Emotion::COUNT]) -> Self {
        Self(values)
    }

    /// Build scores from model output, dropping labels outside the canonical set.
    /// Missing emotions default to 0.
    pub fn from_labeled<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f32)>,
    {
        let mut scores = Self::default();
        for (label, value) in pairs {
            if let Some(emotion) = Emotion::from_label(label) {
                scores[emotion] = value;
            }
        }
        scores
    }

    pub fn with(mut self, emotion: Emotion, value: f32) -> Self {
        self[emotion] = value;
        self
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.0[emotion.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        Emotion::ALL.iter().map(move |&emotion| (emotion, self.get(emotion)))
    }

    pub fn values(&self) -> &[f32; Emotion::COUNT] {
        &self.0
    }

    /// Highest-scoring emotion; ties go to the earlier canonical label.
    pub fn dominant(&self) -> (Emotion, f32) {
        let mut best = (Emotion::ALL[0], self.0[0]);
        for (emotion, value) in self.iter().skip(1) {
            if value > best.1 {
                best = (emotion, value);
            }
        }
        best
    }
}

impl Index<Emotion> for EmotionScores {
    type Output = f32;

    fn index(&self, emotion: Emotion) -> &f32 {
        &self.0[emotion.index()]
    }
}

impl IndexMut<Emotion> for EmotionScores {
    fn index_mut(&mut self, emotion: Emotion) -> &mut f32 {
        &mut self.0[emotion.index()]
    }
}

impl Serialize for EmotionScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Emotion::COUNT))?;
        for (emotion, value) in self.iter() {
            map.serialize_entry(emotion.label(), &value)?;
        }
        map.end()
    }
}
