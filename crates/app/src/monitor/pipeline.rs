//! Runtime supervisor tying together the capture loop, the analysis loop, the
//! viewer streams, and the HTTP surface.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard, Once, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use affect_core::{EmotionAnalyzer, UnavailableAnalyzer};
use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};
use video_ingest::DeviceBackend;

use crate::monitor::{
    analysis::{AnalysisLoop, AnalysisPolicy, spawn_analysis_loop},
    capture::{CapturePolicy, spawn_capture_loop},
    config::{MonitorConfig, SessionContext},
    distribution::{FrameGenerator, StreamPolicy},
    live::LiveUpdateHub,
    server::spawn_control_server,
    sink::{CsvMetricsSink, DiscardSink, RawMetricsSink, SinkError},
    state::{DeviceSnapshot, DeviceState},
    telemetry,
};

/// A running loop thread.
pub struct LoopHandle {
    name: &'static str,
    handle: thread::JoinHandle<()>,
}

impl LoopHandle {
    pub(crate) fn new(name: &'static str, handle: thread::JoinHandle<()>) -> Self {
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit. A panic in the loop is logged, not resumed.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("{} loop panicked", self.name);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub capture_alive: bool,
    pub analysis_alive: bool,
}

/// Operations the HTTP surface (or any other controller) drives.
pub trait MonitorControl: Send + Sync {
    /// Select a device; the capture loop applies it on its next iteration.
    fn configure(&self, index: i32, resolution: &str);
    /// Set the run flag and spawn whichever loops are not alive. Loops left
    /// over from a stopped run are joined first.
    fn start(&self) -> Result<LoopStatus>;
    fn stop(&self);
    fn snapshot(&self) -> DeviceSnapshot;
    fn frame_generator(&self) -> FrameGenerator;
    /// Device indices that currently open, including the one held by capture.
    fn probe_devices(&self) -> Vec<i32>;
    /// Context used by the next analysis run.
    fn set_session_context(&self, context: SessionContext);
    fn session_context(&self) -> SessionContext;
    fn loop_status(&self) -> LoopStatus;
    fn live(&self) -> Arc<LiveUpdateHub>;
}

pub type AnalyzerFactory = Arc<dyn Fn() -> Box<dyn EmotionAnalyzer> + Send + Sync>;
pub type SinkFactory =
    Arc<dyn Fn(&SessionContext) -> Result<Box<dyn RawMetricsSink>, SinkError> + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub struct RuntimePolicies {
    pub capture: CapturePolicy,
    pub analysis: AnalysisPolicy,
    pub stream: StreamPolicy,
    pub probe_max: i32,
}

#[derive(Default)]
struct Loops {
    capture: Option<LoopHandle>,
    analysis: Option<LoopHandle>,
}

impl Loops {
    fn status(&self) -> LoopStatus {
        let alive = |handle: &Option<LoopHandle>| handle.as_ref().is_some_and(|h| !h.is_finished());
        LoopStatus {
            capture_alive: alive(&self.capture),
            analysis_alive: alive(&self.analysis),
        }
    }
}

pub struct MonitorRuntime<B> {
    state: Arc<DeviceState>,
    backend: B,
    policies: RuntimePolicies,
    analyzer_factory: AnalyzerFactory,
    sink_factory: SinkFactory,
    live: Arc<LiveUpdateHub>,
    context: Mutex<SessionContext>,
    loops: Mutex<Loops>,
}

impl<B: DeviceBackend + Clone + Sync> MonitorRuntime<B> {
    pub fn new(backend: B, policies: RuntimePolicies) -> Self {
        Self {
            state: Arc::new(DeviceState::new()),
            backend,
            policies,
            analyzer_factory: Arc::new(|| Box::new(UnavailableAnalyzer) as Box<dyn EmotionAnalyzer>),
            sink_factory: Arc::new(|_: &SessionContext| {
                Ok(Box::new(DiscardSink) as Box<dyn RawMetricsSink>)
            }),
            live: Arc::new(LiveUpdateHub::new()),
            context: Mutex::new(SessionContext::default()),
            loops: Mutex::new(Loops::default()),
        }
    }

    pub fn with_analyzer(mut self, factory: AnalyzerFactory) -> Self {
        self.analyzer_factory = factory;
        self
    }

    pub fn with_sink(mut self, factory: SinkFactory) -> Self {
        self.sink_factory = factory;
        self
    }

    /// Persist raw rows as CSV files under `dir`.
    pub fn with_csv_dir(self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.with_sink(Arc::new(move |context: &SessionContext| {
            CsvMetricsSink::open(&dir, context).map(|sink| Box::new(sink) as Box<dyn RawMetricsSink>)
        }))
    }

    pub fn state(&self) -> Arc<DeviceState> {
        self.state.clone()
    }

    /// Stop, then wait for both loops to exit.
    pub fn shutdown(&self) {
        self.stop();
        let mut loops = lock(&self.loops);
        for handle in [loops.capture.take(), loops.analysis.take()].into_iter().flatten() {
            handle.join();
        }
    }

    fn spawn_analysis(&self) -> Result<LoopHandle> {
        let context = self.session_context();
        let sink: Box<dyn RawMetricsSink> = match (self.sink_factory)(&context) {
            Ok(sink) => sink,
            Err(err) => {
                warn!("Raw metrics disabled for this run: {err}");
                Box::new(DiscardSink)
            }
        };
        let analysis = AnalysisLoop::new(
            self.state.clone(),
            (self.analyzer_factory)(),
            sink,
            self.live.clone(),
            context,
            self.policies.analysis,
        );
        spawn_analysis_loop(analysis).context("Failed to spawn analysis loop")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: DeviceBackend + Clone + Sync> MonitorControl for MonitorRuntime<B> {
    fn configure(&self, index: i32, resolution: &str) {
        info!("Camera selection: #{index} at {resolution}");
        self.state.configure(index, resolution);
    }

    fn start(&self) -> Result<LoopStatus> {
        let mut loops = lock(&self.loops);
        if !self.state.is_running() {
            // Loops from a stopped run may still be releasing the device.
            for previous in [loops.capture.take(), loops.analysis.take()].into_iter().flatten() {
                previous.join();
            }
        }
        self.state.set_running(true);

        if !loops.status().capture_alive {
            if let Some(finished) = loops.capture.take() {
                finished.join();
            }
            loops.capture = Some(
                spawn_capture_loop(self.state.clone(), self.backend.clone(), self.policies.capture)
                    .context("Failed to spawn capture loop")?,
            );
        }
        if !loops.status().analysis_alive {
            if let Some(finished) = loops.analysis.take() {
                finished.join();
            }
            loops.analysis = Some(self.spawn_analysis()?);
        }
        Ok(loops.status())
    }

    fn stop(&self) {
        self.state.set_running(false);
    }

    fn snapshot(&self) -> DeviceSnapshot {
        self.state.snapshot()
    }

    fn frame_generator(&self) -> FrameGenerator {
        FrameGenerator::new(self.state.clone(), self.policies.stream)
    }

    fn probe_devices(&self) -> Vec<i32> {
        let snapshot = self.state.snapshot();
        let held = snapshot.handle_present.then_some(snapshot.selected_index);
        let mut found = self.backend.probe_except(self.policies.probe_max, held);
        if let Some(index) = held.filter(|index| !found.contains(index)) {
            found.push(index);
            found.sort_unstable();
        }
        found
    }

    fn set_session_context(&self, context: SessionContext) {
        *lock(&self.context) = context;
    }

    fn session_context(&self) -> SessionContext {
        lock(&self.context).clone()
    }

    fn loop_status(&self) -> LoopStatus {
        lock(&self.loops).status()
    }

    fn live(&self) -> Arc<LiveUpdateHub> {
        self.live.clone()
    }
}

/// Run the monitor until Ctrl+C.
pub fn run<B: DeviceBackend + Clone + Sync>(config: MonitorConfig, backend: B) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();
    let pipeline_span = tracing::info_span!(
        "monitor.pipeline",
        camera = config.camera_index,
        resolution = %config.resolution,
        port = config.server.port
    );
    let _pipeline_span_guard = pipeline_span.enter();

    let runtime = Arc::new(
        MonitorRuntime::new(
            backend,
            RuntimePolicies {
                capture: config.capture,
                analysis: config.analysis,
                stream: config.stream,
                probe_max: config.probe_max,
            },
        )
        .with_csv_dir(config.csv_dir.clone()),
    );
    runtime.set_session_context(config.session.clone());
    runtime.configure(config.camera_index, &config.resolution.to_string());

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    let handler_state = runtime.state();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_state.set_running(false);
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    if config.autostart {
        runtime.start()?;
    } else {
        info!("Autostart disabled; waiting for POST /api/monitor/start");
    }

    let control: Arc<dyn MonitorControl> = runtime.clone();
    let server = spawn_control_server(control, &config.server)
        .context("Failed to start control server")?;
    info!(
        "Preview at http://{}:{}/video_feed, live updates at /events",
        config.server.bind, config.server.port
    );

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("Stopping classroom monitor");
    runtime.shutdown();
    server.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use video_ingest::{
        BackendCandidate, CaptureDevice, CaptureError, CaptureSettings, Frame, NegotiatedFormat,
    };

    use super::*;

    #[derive(Clone, Default)]
    struct FixedBackend {
        openable: Vec<i32>,
        release_delay: Duration,
        opened: Arc<Mutex<Vec<i32>>>,
    }

    struct FixedDevice {
        release_delay: Duration,
    }

    impl DeviceBackend for FixedBackend {
        type Device = FixedDevice;

        fn candidates(&self) -> Vec<BackendCandidate> {
            vec![BackendCandidate { name: "fixed", id: 0 }]
        }

        fn open(&self, index: i32, _candidate: BackendCandidate) -> Result<FixedDevice, CaptureError> {
            if self.openable.contains(&index) {
                lock(&self.opened).push(index);
                Ok(FixedDevice {
                    release_delay: self.release_delay,
                })
            } else {
                Err(CaptureError::Open { index })
            }
        }
    }

    impl CaptureDevice for FixedDevice {
        fn apply(&mut self, settings: &CaptureSettings) -> NegotiatedFormat {
            NegotiatedFormat {
                width: settings.resolution.width as f64,
                height: settings.resolution.height as f64,
                fps: settings.fps,
            }
        }

        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            Ok(Frame::solid(32, 24, [0, 0, 0]))
        }

        fn release(&mut self) {
            thread::sleep(self.release_delay);
        }
    }

    fn runtime(openable: &[i32]) -> MonitorRuntime<FixedBackend> {
        runtime_with(FixedBackend {
            openable: openable.to_vec(),
            ..FixedBackend::default()
        })
    }

    fn runtime_with(backend: FixedBackend) -> MonitorRuntime<FixedBackend> {
        MonitorRuntime::new(
            backend,
            RuntimePolicies {
                capture: CapturePolicy::with_fps(200.0),
                analysis: AnalysisPolicy {
                    interval: Duration::from_millis(10),
                    idle_sleep: Duration::from_millis(5),
                    ..AnalysisPolicy::default()
                },
                stream: StreamPolicy::default(),
                probe_max: 4,
            },
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn start_spawns_loops_once_and_stop_ends_them() {
        let runtime = runtime(&[0]);
        runtime.configure(0, "32x24");
        let status = runtime.start().unwrap();
        assert!(status.capture_alive && status.analysis_alive);
        assert_eq!(runtime.start().unwrap(), status);

        assert!(wait_until(|| runtime.snapshot().has_frame));
        assert!(wait_until(|| runtime.live().latest().is_some()));

        runtime.stop();
        assert!(wait_until(|| runtime.loop_status() == LoopStatus::default()));
        assert!(!runtime.snapshot().handle_present);

        let restarted = runtime.start().unwrap();
        assert!(restarted.capture_alive);
        runtime.shutdown();
        assert_eq!(runtime.loop_status(), LoopStatus::default());
    }

    #[test]
    fn quick_restart_waits_for_the_releasing_loop() {
        let runtime = runtime_with(FixedBackend {
            openable: vec![0],
            release_delay: Duration::from_millis(300),
            ..FixedBackend::default()
        });
        runtime.configure(0, "32x24");
        runtime.start().unwrap();
        assert!(wait_until(|| runtime.snapshot().handle_present));

        runtime.stop();
        thread::sleep(Duration::from_millis(50));
        let restarted = runtime.start().unwrap();
        assert!(restarted.capture_alive && restarted.analysis_alive);

        thread::sleep(Duration::from_millis(600));
        assert!(runtime.snapshot().running);
        assert_eq!(
            runtime.loop_status(),
            LoopStatus {
                capture_alive: true,
                analysis_alive: true,
            }
        );
        assert!(wait_until(|| runtime.snapshot().handle_present));
        runtime.shutdown();
    }

    #[test]
    fn probe_reports_the_held_device_without_reopening_it() {
        let backend = FixedBackend {
            openable: vec![1, 2, 3],
            ..FixedBackend::default()
        };
        let runtime = runtime_with(backend.clone());
        assert_eq!(runtime.probe_devices(), vec![1, 2, 3]);
        lock(&backend.opened).clear();

        runtime.state.publish_session(Some(crate::monitor::state::SessionInfo {
            backend: "fixed",
            negotiated: NegotiatedFormat::default(),
        }));
        runtime.configure(2, "640x480");
        assert_eq!(runtime.probe_devices(), vec![1, 2, 3]);
        assert_eq!(*lock(&backend.opened), vec![1, 3]);
    }

    #[test]
    fn probe_lists_a_held_device_outside_the_scan_range() {
        let runtime = runtime(&[1]);
        runtime.state.publish_session(Some(crate::monitor::state::SessionInfo {
            backend: "fixed",
            negotiated: NegotiatedFormat::default(),
        }));
        runtime.configure(7, "640x480");
        assert_eq!(runtime.probe_devices(), vec![1, 7]);
    }

    #[test]
    fn session_context_is_replaced() {
        let runtime = runtime(&[]);
        let context = SessionContext {
            grade: Some("5A".into()),
            ..SessionContext::default()
        };
        runtime.set_session_context(context.clone());
        assert_eq!(runtime.session_context(), context);
    }
}
