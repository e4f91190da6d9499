//! Per-viewer frame generator.
//!
//! A generator only reads [`DeviceState`]; it never waits for a fresh frame and
//! re-sends the latest one (or a placeholder) at its own rate. The HTTP stream
//! and the blocking iterator both drive [`FrameGenerator::poll_chunk`].

use std::{sync::Arc, thread, time::Duration};

use tracing::{debug, warn};

use crate::monitor::{
    annotation::render_placeholder,
    encoding::{encode_frame_jpeg, encode_image_jpeg, multipart_chunk},
    state::{DeviceState, ViewerView},
};

pub const NOT_CONFIGURED_MESSAGE: &str = "camera not configured";
pub const WAITING_MESSAGE: &str = "waiting for camera";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamPolicy {
    pub fps: f64,
    pub jpeg_quality: u8,
    pub placeholder_width: u32,
    pub placeholder_height: u32,
}

impl StreamPolicy {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(0.1))
    }
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            fps: 30.0,
            jpeg_quality: 85,
            placeholder_width: 640,
            placeholder_height: 480,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum GeneratorStep {
    /// Capture stopped; the sequence is over.
    Finished,
    /// Encoding failed; nothing to send this iteration.
    Skipped,
    Chunk(Vec<u8>),
}

pub struct FrameGenerator {
    state: Arc<DeviceState>,
    policy: StreamPolicy,
}

impl FrameGenerator {
    pub fn new(state: Arc<DeviceState>, policy: StreamPolicy) -> Self {
        Self { state, policy }
    }

    pub fn frame_interval(&self) -> Duration {
        self.policy.frame_interval()
    }

    pub fn poll_chunk(&mut self) -> GeneratorStep {
        let ViewerView {
            running,
            frame,
            last_error,
            selected_index,
        } = self.state.viewer_view();
        if !running {
            return GeneratorStep::Finished;
        }

        let encoded = match frame {
            Some(frame) => encode_frame_jpeg(&frame, self.policy.jpeg_quality),
            None => {
                let message = placeholder_message(last_error.as_deref(), selected_index);
                let image = render_placeholder(
                    self.policy.placeholder_width,
                    self.policy.placeholder_height,
                    message,
                );
                encode_image_jpeg(&image, self.policy.jpeg_quality)
            }
        };

        match encoded {
            Ok(jpeg) => {
                metrics::counter!("monitor_stream_chunks_total").increment(1);
                GeneratorStep::Chunk(multipart_chunk(&jpeg))
            }
            Err(err) => {
                warn!("Skipping viewer frame: {err}");
                metrics::counter!("monitor_stream_encode_errors_total").increment(1);
                GeneratorStep::Skipped
            }
        }
    }
}

/// Blocking driver: yields chunks paced to the stream rate until capture stops.
impl Iterator for FrameGenerator {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.poll_chunk() {
                GeneratorStep::Finished => {
                    debug!("Viewer stream finished");
                    return None;
                }
                GeneratorStep::Skipped => thread::sleep(self.frame_interval()),
                GeneratorStep::Chunk(chunk) => {
                    thread::sleep(self.frame_interval());
                    return Some(chunk);
                }
            }
        }
    }
}

fn placeholder_message(last_error: Option<&str>, selected_index: i32) -> &str {
    match last_error {
        Some(error) => error,
        None if selected_index < 0 => NOT_CONFIGURED_MESSAGE,
        None => WAITING_MESSAGE,
    }
}
