//! Capture loop: the only owner of the device handle.
//!
//! Each iteration re-reads the selection from [`DeviceState`], reopens the
//! device when the selection changed or the handle was dropped, reads one
//! frame, and publishes the result. Open and read failures are recorded in
//! `last_error` and retried; only `running == false` ends the loop.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};
use video_ingest::{
    BackendCandidate, CaptureDevice, CaptureSettings, DeviceBackend, NegotiatedFormat, Resolution,
};

use crate::monitor::{
    pipeline::LoopHandle,
    state::{CaptureView, DeviceState, SessionInfo},
    telemetry,
};

pub const DEFAULT_CAPTURE_FPS: f64 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CapturePolicy {
    /// Target read rate; also requested from the device.
    pub target_fps: f64,
    /// Consecutive failed reads before the handle is dropped and reopened.
    pub failure_threshold: u32,
}

impl CapturePolicy {
    /// Policy whose failure threshold equals one second of frames.
    pub fn with_fps(target_fps: f64) -> Self {
        Self {
            target_fps,
            failure_threshold: target_fps.round().max(1.0) as u32,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_fps.max(0.1))
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self::with_fps(DEFAULT_CAPTURE_FPS)
    }
}

/// One open device handle and its bookkeeping.
pub struct CaptureSession<D> {
    device: D,
    backend: BackendCandidate,
    negotiated: NegotiatedFormat,
    consecutive_failures: u32,
}

impl<D> CaptureSession<D> {
    pub fn backend(&self) -> BackendCandidate {
        self.backend
    }

    pub fn negotiated(&self) -> NegotiatedFormat {
        self.negotiated
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureStep {
    Continue,
    Stopped,
}

pub struct CaptureLoop<B: DeviceBackend> {
    state: Arc<DeviceState>,
    backend: B,
    policy: CapturePolicy,
    session: Option<CaptureSession<B::Device>>,
    applied: Option<(i32, String)>,
    last_open_error: Option<String>,
}

impl<B: DeviceBackend> CaptureLoop<B> {
    pub fn new(state: Arc<DeviceState>, backend: B, policy: CapturePolicy) -> Self {
        Self {
            state,
            backend,
            policy,
            session: None,
            applied: None,
            last_open_error: None,
        }
    }

    pub fn session(&self) -> Option<&CaptureSession<B::Device>> {
        self.session.as_ref()
    }

    /// Run one iteration without sleeping.
    pub fn step(&mut self) -> CaptureStep {
        let CaptureView {
            running,
            selected_index,
            resolution,
        } = self.state.capture_view();

        if !running {
            self.release();
            return CaptureStep::Stopped;
        }

        let selection_changed = self
            .applied
            .as_ref()
            .is_none_or(|(index, res)| *index != selected_index || *res != resolution);
        if selection_changed || self.session.is_none() {
            self.release();
            self.applied = Some((selected_index, resolution.clone()));
            self.open(selected_index, &resolution);
        }

        let threshold = self.policy.failure_threshold.max(1);
        let Some(session) = self.session.as_mut() else {
            self.state.publish_frame(None);
            return CaptureStep::Continue;
        };

        match session.device.read_frame() {
            Ok(frame) => {
                session.consecutive_failures = 0;
                metrics::counter!("monitor_capture_frames_total").increment(1);
                self.state.publish_frame(Some(frame));
                self.state.publish_error(None);
            }
            Err(err) => {
                session.consecutive_failures += 1;
                metrics::counter!("monitor_capture_read_failures_total").increment(1);
                self.state.publish_frame(None);
                let failures = session.consecutive_failures;
                debug!("Frame read failed ({failures}/{threshold}): {err}");
                if failures >= threshold {
                    warn!(
                        "Device #{selected_index} failed {failures} consecutive reads; reopening"
                    );
                    self.state.publish_error(Some(format!(
                        "camera #{selected_index} stopped delivering frames ({err}); reopening"
                    )));
                    self.release();
                }
            }
        }

        CaptureStep::Continue
    }

    /// Loop until the run flag clears, pacing to the target frame rate.
    pub fn run(mut self) {
        let interval = self.policy.frame_interval();
        let mut last_frame = Instant::now();
        info!(
            "Capture loop started (target {:.1} fps, reopen after {} failed reads)",
            self.policy.target_fps, self.policy.failure_threshold
        );
        loop {
            let started = Instant::now();
            if self.step() == CaptureStep::Stopped {
                break;
            }
            metrics::histogram!("monitor_capture_frame_interval_seconds")
                .record(started.duration_since(last_frame).as_secs_f64());
            last_frame = started;
            thread::sleep(interval.saturating_sub(started.elapsed()));
        }
        info!("Capture loop stopped");
    }

    fn open(&mut self, index: i32, resolution: &str) {
        let _open_span = tracing::info_span!("capture.open", index, resolution).entered();

        if index < 0 {
            self.record_open_failure("no camera selected".to_string());
            return;
        }
        let resolution = match resolution.parse::<Resolution>() {
            Ok(resolution) => resolution,
            Err(err) => {
                self.record_open_failure(err.to_string());
                return;
            }
        };
        let settings = CaptureSettings {
            resolution,
            fps: self.policy.target_fps,
        };

        let mut failures = Vec::new();
        for candidate in self.backend.candidates() {
            match self.backend.open(index, candidate) {
                Ok(mut device) => {
                    let negotiated = device.apply(&settings);
                    info!(
                        "Opened camera #{index} via {} (requested {resolution} @ {:.0} fps, got {}x{} @ {:.1} fps)",
                        candidate.name,
                        settings.fps,
                        negotiated.width,
                        negotiated.height,
                        negotiated.fps
                    );
                    metrics::counter!("monitor_capture_reopens_total").increment(1);
                    self.state.publish_session(Some(SessionInfo {
                        backend: candidate.name,
                        negotiated,
                    }));
                    self.state.publish_error(None);
                    self.last_open_error = None;
                    self.session = Some(CaptureSession {
                        device,
                        backend: candidate,
                        negotiated,
                        consecutive_failures: 0,
                    });
                    return;
                }
                Err(err) => {
                    debug!("Backend {} could not open camera #{index}: {err}", candidate.name);
                    failures.push(candidate.name);
                }
            }
        }

        metrics::counter!("monitor_capture_open_failures_total").increment(1);
        self.record_open_failure(format!(
            "could not open camera #{index} (tried {})",
            failures.join(", ")
        ));
    }

    fn record_open_failure(&mut self, message: String) {
        if self.last_open_error.as_deref() != Some(message.as_str()) {
            warn!("{message}");
        }
        self.state.publish_error(Some(message.clone()));
        self.last_open_error = Some(message);
    }

    fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!("Releasing capture handle ({})", session.backend.name);
            session.device.release();
            self.state.publish_session(None);
        }
    }
}

impl<B: DeviceBackend> Drop for CaptureLoop<B> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Spawn the capture loop on its own named thread.
pub fn spawn_capture_loop<B: DeviceBackend>(
    state: Arc<DeviceState>,
    backend: B,
    policy: CapturePolicy,
) -> std::io::Result<LoopHandle> {
    let handle = telemetry::spawn_thread("monitor-capture", move || {
        CaptureLoop::new(state, backend, policy).run();
    })?;
    Ok(LoopHandle::new("capture", handle))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use video_ingest::{CaptureError, Frame};

    use super::*;

    #[derive(Default)]
    struct Counters {
        opens: AtomicU32,
        releases: AtomicU32,
        reads: AtomicU32,
    }

    /// Backend whose behaviour is scripted per test.
    #[derive(Clone)]
    struct StubBackend {
        counters: Arc<Counters>,
        openable: Arc<Mutex<Vec<i32>>>,
        failing_reads: Arc<AtomicU32>,
    }

    impl StubBackend {
        fn new(openable: &[i32]) -> Self {
            Self {
                counters: Arc::new(Counters::default()),
                openable: Arc::new(Mutex::new(openable.to_vec())),
                failing_reads: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    struct StubDevice {
        counters: Arc<Counters>,
        failing_reads: Arc<AtomicU32>,
        size: (i32, i32),
    }

    impl DeviceBackend for StubBackend {
        type Device = StubDevice;

        fn candidates(&self) -> Vec<BackendCandidate> {
            vec![
                BackendCandidate { name: "primary", id: 1 },
                BackendCandidate { name: "fallback", id: 0 },
            ]
        }

        fn open(&self, index: i32, candidate: BackendCandidate) -> Result<StubDevice, CaptureError> {
            if candidate.name == "primary" || !self.openable.lock().unwrap().contains(&index) {
                return Err(CaptureError::Open { index });
            }
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            Ok(StubDevice {
                counters: self.counters.clone(),
                failing_reads: self.failing_reads.clone(),
                size: (0, 0),
            })
        }
    }

    impl CaptureDevice for StubDevice {
        fn apply(&mut self, settings: &CaptureSettings) -> NegotiatedFormat {
            self.size = (settings.resolution.width, settings.resolution.height);
            NegotiatedFormat {
                width: self.size.0 as f64,
                height: self.size.1 as f64,
                fps: settings.fps,
            }
        }

        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
            let pending = self.failing_reads.load(Ordering::SeqCst);
            if pending > 0 {
                self.failing_reads.store(pending - 1, Ordering::SeqCst);
                return Err(CaptureError::EmptyFrame);
            }
            Ok(Frame::solid(self.size.0, self.size.1, [0, 0, 0]))
        }

        fn release(&mut self) {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn running_state(index: i32, resolution: &str) -> Arc<DeviceState> {
        let state = Arc::new(DeviceState::new());
        state.configure(index, resolution);
        state.set_running(true);
        state
    }

    #[test]
    fn unopenable_device_reports_error_without_frames() {
        let state = running_state(5, "640x480");
        let backend = StubBackend::new(&[0]);
        let mut capture = CaptureLoop::new(state.clone(), backend.clone(), CapturePolicy::default());

        for _ in 0..50 {
            assert_eq!(capture.step(), CaptureStep::Continue);
            let snapshot = state.snapshot();
            assert!(snapshot.last_error.is_some());
            assert!(snapshot.current_frame.is_none());
            assert!(!snapshot.handle_present);
        }
        assert_eq!(backend.counters.opens.load(Ordering::SeqCst), 0);
        let error = state.snapshot().last_error.unwrap();
        assert!(error.contains("#5"), "{error}");
        assert!(error.contains("primary, fallback"), "{error}");
    }

    #[test]
    fn falls_through_candidates_and_publishes_frames() {
        let state = running_state(0, "320x240");
        let backend = StubBackend::new(&[0]);
        let mut capture = CaptureLoop::new(state.clone(), backend.clone(), CapturePolicy::default());

        capture.step();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.frame_size, Some((320, 240)));
        assert!(snapshot.handle_present);
        assert_eq!(snapshot.session.map(|s| s.backend), Some("fallback"));
        assert!(snapshot.last_error.is_none());
        assert_eq!(capture.session().map(|s| s.backend().name), Some("fallback"));
    }

    #[test]
    fn read_failure_streak_forces_reopen() {
        let state = running_state(0, "640x480");
        let backend = StubBackend::new(&[0]);
        let policy = CapturePolicy {
            target_fps: 30.0,
            failure_threshold: 5,
        };
        let mut capture = CaptureLoop::new(state.clone(), backend.clone(), policy);

        capture.step();
        assert_eq!(backend.counters.opens.load(Ordering::SeqCst), 1);

        backend.failing_reads.store(5, Ordering::SeqCst);
        for _ in 0..4 {
            capture.step();
            assert!(state.snapshot().current_frame.is_none());
        }
        assert_eq!(capture.session().map(|s| s.consecutive_failures()), Some(4));
        assert_eq!(backend.counters.releases.load(Ordering::SeqCst), 0);

        capture.step();
        assert_eq!(backend.counters.releases.load(Ordering::SeqCst), 1);
        assert!(capture.session().is_none());
        assert!(!state.snapshot().handle_present);
        assert!(state.snapshot().last_error.is_some());

        capture.step();
        assert_eq!(backend.counters.opens.load(Ordering::SeqCst), 2);
        assert_eq!(capture.session().map(|s| s.consecutive_failures()), Some(0));
        assert!(state.snapshot().current_frame.is_some());
    }

    #[test]
    fn selection_change_reopens_device() {
        let state = running_state(0, "640x480");
        let backend = StubBackend::new(&[0, 1]);
        let mut capture = CaptureLoop::new(state.clone(), backend.clone(), CapturePolicy::default());

        capture.step();
        capture.step();
        assert_eq!(backend.counters.opens.load(Ordering::SeqCst), 1);

        state.configure(1, "320x240");
        capture.step();
        assert_eq!(backend.counters.opens.load(Ordering::SeqCst), 2);
        assert_eq!(backend.counters.releases.load(Ordering::SeqCst), 1);
        assert_eq!(state.snapshot().frame_size, Some((320, 240)));
    }

    #[test]
    fn invalid_selection_is_reported_without_touching_backend() {
        let state = running_state(0, "big");
        let backend = StubBackend::new(&[0]);
        let mut capture = CaptureLoop::new(state.clone(), backend.clone(), CapturePolicy::default());
        capture.step();
        let error = state.snapshot().last_error.unwrap();
        assert!(error.contains("invalid resolution"), "{error}");

        state.configure(-1, "640x480");
        capture.step();
        assert_eq!(state.snapshot().last_error.as_deref(), Some("no camera selected"));
        assert_eq!(backend.counters.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stopping_releases_handle_and_exits() {
        let state = running_state(0, "640x480");
        let backend = StubBackend::new(&[0]);
        let mut capture = CaptureLoop::new(state.clone(), backend.clone(), CapturePolicy::default());
        capture.step();
        assert!(state.snapshot().handle_present);

        state.set_running(false);
        assert_eq!(capture.step(), CaptureStep::Stopped);
        assert_eq!(backend.counters.releases.load(Ordering::SeqCst), 1);
        assert!(!state.snapshot().handle_present);
    }

    #[test]
    fn spawned_loop_exits_when_flag_clears() {
        let state = running_state(0, "64x48");
        let backend = StubBackend::new(&[0]);
        let handle =
            spawn_capture_loop(state.clone(), backend.clone(), CapturePolicy::with_fps(200.0))
                .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !state.snapshot().has_frame && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(state.snapshot().has_frame);

        state.set_running(false);
        handle.join();
        assert!(!state.snapshot().handle_present);
        assert_eq!(
            backend.counters.opens.load(Ordering::SeqCst),
            backend.counters.releases.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn default_threshold_is_one_second_of_frames() {
        assert_eq!(CapturePolicy::default().failure_threshold, 30);
        assert_eq!(CapturePolicy::with_fps(15.0).failure_threshold, 15);
    }
}
