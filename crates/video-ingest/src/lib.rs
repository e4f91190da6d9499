//! Video device access for the classroom monitor.
//!
//! The capture loop only sees the [`DeviceBackend`] / [`CaptureDevice`] traits.
//! The OpenCV implementation is compiled with the `opencv` feature.

mod backend;
#[cfg(feature = "opencv")]
mod camera;
mod types;

pub use backend::{BackendCandidate, CaptureDevice, DeviceBackend};
#[cfg(feature = "opencv")]
pub use camera::{OpenCvBackend, OpenCvDevice};
pub use types::{CaptureError, CaptureSettings, Frame, FrameFormat, NegotiatedFormat, Resolution};

/// Parse a `/dev/videoX` style URI or bare ordinal and return the index.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}
