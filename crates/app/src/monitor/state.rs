//! Shared device state: selection, run flag, latest frame, last error.
//!
//! Every accessor takes the same mutex and only copies fields while holding
//! it. Frames go in and come out as owned copies, so no reader ever shares a
//! buffer with the capture loop.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use video_ingest::{Frame, NegotiatedFormat};

/// Sentinel for "no device selected".
pub const NO_DEVICE: i32 = -1;

/// Diagnostics for the currently open capture session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionInfo {
    pub backend: &'static str,
    pub negotiated: NegotiatedFormat,
}

struct DeviceInner {
    selected_index: i32,
    resolution: String,
    running: bool,
    current_frame: Option<Frame>,
    last_error: Option<String>,
    handle_present: bool,
    session: Option<SessionInfo>,
}

pub struct DeviceState {
    inner: Mutex<DeviceInner>,
}

/// Read-only copy of every field, for status reporting.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceSnapshot {
    pub selected_index: i32,
    pub resolution: String,
    pub running: bool,
    #[serde(skip)]
    pub current_frame: Option<Frame>,
    pub has_frame: bool,
    pub frame_size: Option<(i32, i32)>,
    pub last_error: Option<String>,
    pub handle_present: bool,
    pub session: Option<SessionInfo>,
}

/// What the capture loop needs at the top of every iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CaptureView {
    pub(crate) running: bool,
    pub(crate) selected_index: i32,
    pub(crate) resolution: String,
}

/// Result of asking for an analysis sample.
#[derive(Debug)]
pub(crate) enum FrameSample {
    Stopped,
    Pending,
    Ready(Frame),
}

/// What a frame generator needs per iteration.
#[derive(Debug)]
pub(crate) struct ViewerView {
    pub(crate) running: bool,
    pub(crate) frame: Option<Frame>,
    pub(crate) last_error: Option<String>,
    pub(crate) selected_index: i32,
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DeviceInner {
                selected_index: NO_DEVICE,
                resolution: String::new(),
                running: false,
                current_frame: None,
                last_error: None,
                handle_present: false,
                session: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select a device and resolution. Applied by the capture loop on its next
    /// iteration; nothing is opened or validated here.
    pub fn configure(&self, index: i32, resolution: impl Into<String>) {
        let resolution = resolution.into();
        let mut guard = self.lock();
        guard.selected_index = index;
        guard.resolution = resolution;
    }

    pub fn set_running(&self, running: bool) {
        self.lock().running = running;
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let guard = self.lock();
        let current_frame = guard.current_frame.clone();
        DeviceSnapshot {
            selected_index: guard.selected_index,
            resolution: guard.resolution.clone(),
            running: guard.running,
            has_frame: current_frame.is_some(),
            frame_size: current_frame.as_ref().map(|f| (f.width, f.height)),
            current_frame,
            last_error: guard.last_error.clone(),
            handle_present: guard.handle_present,
            session: guard.session.clone(),
        }
    }

    pub(crate) fn publish_frame(&self, frame: Option<Frame>) {
        self.lock().current_frame = frame;
    }

    pub(crate) fn publish_error(&self, error: Option<String>) {
        self.lock().last_error = error;
    }

    /// Record whether the capture loop holds a handle and what it negotiated.
    pub(crate) fn publish_session(&self, session: Option<SessionInfo>) {
        let mut guard = self.lock();
        guard.handle_present = session.is_some();
        guard.session = session;
    }

    pub(crate) fn capture_view(&self) -> CaptureView {
        let guard = self.lock();
        CaptureView {
            running: guard.running,
            selected_index: guard.selected_index,
            resolution: guard.resolution.clone(),
        }
    }

    /// Copy the current frame when a sample is `due`.
    pub(crate) fn sample_frame(&self, due: bool) -> FrameSample {
        let guard = self.lock();
        if !guard.running {
            return FrameSample::Stopped;
        }
        match (due, guard.current_frame.as_ref()) {
            (true, Some(frame)) => FrameSample::Ready(frame.clone()),
            _ => FrameSample::Pending,
        }
    }

    pub(crate) fn viewer_view(&self) -> ViewerView {
        let guard = self.lock();
        ViewerView {
            running: guard.running,
            frame: guard.current_frame.clone(),
            last_error: guard.last_error.clone(),
            selected_index: guard.selected_index,
        }
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unselected_and_stopped() {
        let state = DeviceState::new();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.selected_index, NO_DEVICE);
        assert!(!snapshot.running);
        assert!(!snapshot.has_frame);
        assert!(!snapshot.handle_present);
    }

    #[test]
    fn configure_and_running_are_independent() {
        let state = DeviceState::new();
        state.configure(2, "1280x720");
        assert!(!state.is_running());
        state.set_running(true);
        let view = state.capture_view();
        assert_eq!(
            view,
            CaptureView {
                running: true,
                selected_index: 2,
                resolution: "1280x720".into(),
            }
        );
        state.configure(0, "640x480");
        assert!(state.is_running());
    }

    #[test]
    fn snapshots_never_alias_the_published_frame() {
        let state = DeviceState::new();
        let frame = Frame::solid(8, 8, [10, 20, 30]);
        let published_ptr = frame.data.as_ptr();
        state.publish_frame(Some(frame));

        let first = state.snapshot().current_frame.unwrap();
        let second = state.snapshot().current_frame.unwrap();
        assert_ne!(first.data.as_ptr(), published_ptr);
        assert_ne!(first.data.as_ptr(), second.data.as_ptr());
        assert_eq!(first, second);

        let mut mutated = first;
        mutated.data[0] = 255;
        assert_eq!(state.snapshot().current_frame.unwrap().data[0], 10);
    }

    #[test]
    fn sample_frame_respects_run_flag_and_due() {
        let state = DeviceState::new();
        assert!(matches!(state.sample_frame(true), FrameSample::Stopped));
        state.set_running(true);
        assert!(matches!(state.sample_frame(true), FrameSample::Pending));
        state.publish_frame(Some(Frame::solid(2, 2, [0, 0, 0])));
        assert!(matches!(state.sample_frame(false), FrameSample::Pending));
        assert!(matches!(state.sample_frame(true), FrameSample::Ready(_)));
    }

    #[test]
    fn session_publication_drives_handle_flag() {
        let state = DeviceState::new();
        state.publish_session(Some(SessionInfo {
            backend: "stub",
            negotiated: NegotiatedFormat::default(),
        }));
        assert!(state.snapshot().handle_present);
        state.publish_session(None);
        let snapshot = state.snapshot();
        assert!(!snapshot.handle_present);
        assert!(snapshot.session.is_none());
    }
}
