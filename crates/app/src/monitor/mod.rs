//! Classroom monitor: one camera, three loops, one shared state.
//!
//! - `state`: the mutex-guarded device state every loop reads.
//! - `capture`: owns the device handle and publishes frames.
//! - `analysis`: samples frames, runs inference, publishes group ticks.
//! - `distribution`: per-viewer MJPEG chunk generator.
//! - `sink` / `live`: raw CSV rows and live tick fan-out.
//! - `pipeline`: runtime supervisor and the `MonitorControl` surface.
//! - `server`: Actix Web routes over `MonitorControl`.
//! - `config`, `telemetry`: CLI parsing and tracing/metrics setup.

pub use analysis::{AnalysisLoop, AnalysisPolicy, AnalysisStep, spawn_analysis_loop};
pub use capture::{CaptureLoop, CapturePolicy, CaptureSession, CaptureStep, spawn_capture_loop};
pub use config::{MonitorCliArgs, MonitorConfig, SessionContext};
pub use distribution::{FrameGenerator, GeneratorStep, StreamPolicy};
pub use live::{LiveUpdateHub, LiveUpdateSink};
pub use pipeline::{
    AnalyzerFactory, LoopHandle, LoopStatus, MonitorControl, MonitorRuntime, RuntimePolicies,
    SinkFactory, run,
};
pub use sink::{CsvMetricsSink, DiscardSink, RawMetricRow, RawMetricsSink, SinkError};
pub use state::{DeviceSnapshot, DeviceState, NO_DEVICE, SessionInfo};

mod analysis;
mod annotation;
mod capture;
mod config;
mod distribution;
mod encoding;
mod live;
mod pipeline;
mod server;
mod sink;
mod state;
mod telemetry;
