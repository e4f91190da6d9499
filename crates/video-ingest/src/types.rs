use std::{fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;

/// Owned BGR frame captured from a video device.
///
/// Cloning a frame deep-copies the pixel buffer, so a clone never aliases the
/// buffer a capture backend keeps reusing.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

impl Frame {
    /// Build a frame where every pixel has the same BGR value.
    pub fn solid(width: i32, height: i32, bgr: [u8; 3]) -> Self {
        let pixels = (width.max(0) as usize) * (height.max(0) as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&bgr);
        }
        Self {
            data,
            width,
            height,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }
    }

    /// Number of bytes a well-formed buffer of this size must hold.
    pub fn expected_len(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * self.format.bytes_per_pixel()
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video device #{index}")]
    Open { index: i32 },
    #[error("video device #{index} rejected backend {backend}")]
    Backend { index: i32, backend: &'static str },
    #[error("device returned an empty frame")]
    EmptyFrame,
    #[error("invalid resolution {0:?}, expected WIDTHxHEIGHT")]
    InvalidResolution(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Requested capture size parsed from a `WIDTHxHEIGHT` string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: i32,
    pub height: i32,
}

impl Resolution {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl FromStr for Resolution {
    type Err = CaptureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || CaptureError::InvalidResolution(value.to_string());
        let (w, h) = value
            .trim()
            .split_once(&['x', 'X'][..])
            .ok_or_else(invalid)?;
        let width = w.trim().parse::<i32>().map_err(|_| invalid())?;
        let height = h.trim().parse::<i32>().map_err(|_| invalid())?;
        if width <= 0 || height <= 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Settings pushed onto a freshly opened device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureSettings {
    pub resolution: Resolution,
    pub fps: f64,
}

/// Values the device actually reports after [`CaptureSettings`] were applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct NegotiatedFormat {
    pub width: f64,
    pub height: f64,
    pub fps: f64,
}
