//! Analysis loop: samples the latest frame, runs inference, and publishes a
//! group tick.
//!
//! Every sample produces exactly one tick. Missing inference, no faces, a
//! failed or panicking analyzer all collapse to a zero-face tick so live
//! consumers keep receiving a heartbeat.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use affect_core::{
    AnalyzerError, CognitiveLoadWeights, DEFAULT_ENGAGED_THRESHOLD, EmotionAnalyzer, GroupTick,
    engaged_subset, summarize,
};
use chrono::Local;
use tracing::{debug, error, info, warn};
use video_ingest::Frame;

use crate::monitor::{
    config::SessionContext,
    live::LiveUpdateSink,
    pipeline::LoopHandle,
    sink::{RawMetricRow, RawMetricsSink},
    state::{DeviceState, FrameSample},
    telemetry,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnalysisPolicy {
    /// Minimum time between two samples.
    pub interval: Duration,
    pub engaged_threshold: f32,
    /// Back-off while no sample is due or no frame exists.
    pub idle_sleep: Duration,
    pub weights: CognitiveLoadWeights,
}

impl Default for AnalysisPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            engaged_threshold: DEFAULT_ENGAGED_THRESHOLD,
            idle_sleep: Duration::from_millis(100),
            weights: CognitiveLoadWeights::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnalysisStep {
    Stopped,
    Idle,
    Published(GroupTick),
}

pub struct AnalysisLoop<A, S> {
    state: Arc<DeviceState>,
    analyzer: A,
    raw_sink: S,
    live: Arc<dyn LiveUpdateSink>,
    context: SessionContext,
    policy: AnalysisPolicy,
    last_sample: Option<Instant>,
    reported_unavailable: bool,
}

impl<A: EmotionAnalyzer, S: RawMetricsSink> AnalysisLoop<A, S> {
    pub fn new(
        state: Arc<DeviceState>,
        analyzer: A,
        raw_sink: S,
        live: Arc<dyn LiveUpdateSink>,
        context: SessionContext,
        policy: AnalysisPolicy,
    ) -> Self {
        Self {
            state,
            analyzer,
            raw_sink,
            live,
            context,
            policy,
            last_sample: None,
            reported_unavailable: false,
        }
    }

    /// Take one sample if one is due; never sleeps.
    pub fn step(&mut self) -> AnalysisStep {
        let due = self
            .last_sample
            .is_none_or(|at| at.elapsed() >= self.policy.interval);
        let frame = match self.state.sample_frame(due) {
            FrameSample::Stopped => return AnalysisStep::Stopped,
            FrameSample::Pending => return AnalysisStep::Idle,
            FrameSample::Ready(frame) => frame,
        };
        self.last_sample = Some(Instant::now());

        let span = tracing::info_span!(
            "analysis.sample",
            width = frame.width,
            height = frame.height,
            faces = tracing::field::Empty
        );
        let _guard = span.enter();
        let started = Instant::now();

        let tick = match panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(&frame))) {
            Ok(Ok(tick)) => tick,
            Ok(Err(AnalyzerError::Unavailable)) => {
                if !self.reported_unavailable {
                    warn!(
                        "Emotion analyzer '{}' is unavailable; publishing zero-face ticks",
                        self.analyzer.name()
                    );
                    self.reported_unavailable = true;
                }
                GroupTick::empty(Local::now())
            }
            Ok(Err(err)) => {
                warn!("Analysis failed: {err}");
                metrics::counter!("monitor_analysis_errors_total").increment(1);
                GroupTick::empty(Local::now())
            }
            Err(payload) => {
                error!("Analyzer panicked: {}", panic_message(payload.as_ref()));
                metrics::counter!("monitor_analysis_errors_total").increment(1);
                GroupTick::empty(Local::now())
            }
        };

        span.record("faces", tick.face_count);
        metrics::histogram!("monitor_analysis_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("monitor_analysis_ticks_total").increment(1);
        metrics::gauge!("monitor_analysis_faces").set(tick.face_count as f64);
        if let Some(load) = tick.cognitive_load {
            metrics::gauge!("monitor_cognitive_load").set(load as f64);
        }

        self.live.publish(&tick);
        AnalysisStep::Published(tick)
    }

    /// Loop until the run flag clears.
    pub fn run(mut self) {
        info!(
            "Analysis loop started (analyzer {}, every {} ms, engaged >= {})",
            self.analyzer.name(),
            self.policy.interval.as_millis(),
            self.policy.engaged_threshold
        );
        loop {
            match self.step() {
                AnalysisStep::Stopped => break,
                AnalysisStep::Idle => thread::sleep(self.policy.idle_sleep),
                AnalysisStep::Published(tick) => {
                    debug!(
                        "Tick: {} faces, {:?}, load {:?}",
                        tick.face_count, tick.dominant, tick.cognitive_load
                    );
                }
            }
        }
        info!("Analysis loop stopped");
    }

    fn evaluate(&mut self, frame: &Frame) -> Result<GroupTick, AnalyzerError> {
        if !frame.is_well_formed() {
            return Err(AnalyzerError::UnsupportedFrame(format!(
                "{}x{} frame carries {} bytes, expected {}",
                frame.width,
                frame.height,
                frame.data.len(),
                frame.expected_len()
            )));
        }
        let faces = self.analyzer.analyze(frame)?;
        let now = Local::now();

        if faces.first().is_none_or(|face| face.face_confidence <= 0.0) {
            return Ok(GroupTick::empty(now));
        }

        let rows: Vec<RawMetricRow> = faces
            .iter()
            .flat_map(|face| RawMetricRow::for_face(face, &now, &self.context))
            .collect();
        if let Err(err) = self.raw_sink.append(&rows) {
            warn!("Failed to persist {} raw metric rows: {err}", rows.len());
        }

        let engaged = engaged_subset(&faces, self.policy.engaged_threshold);
        Ok(match summarize(&engaged, &self.policy.weights) {
            Some(summary) => GroupTick::from_summary(now, summary),
            None => GroupTick::empty(now),
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Spawn the analysis loop on its own named thread.
pub fn spawn_analysis_loop<A, S>(analysis: AnalysisLoop<A, S>) -> std::io::Result<LoopHandle>
where
    A: EmotionAnalyzer + 'static,
    S: RawMetricsSink + 'static,
{
    let handle = telemetry::spawn_thread("monitor-analysis", move || analysis.run())?;
    Ok(LoopHandle::new("analysis", handle))
}
