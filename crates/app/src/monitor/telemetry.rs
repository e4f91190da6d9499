//! Telemetry helpers for tracing spans and Prometheus metrics.

use std::{io, path::Path, sync::OnceLock, thread, time::Duration};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::Dispatch;
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::monitor::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Keeps the telemetry subscriber alive for the monitor run.
pub(crate) struct TelemetryGuard {
    /// Set only when another global subscriber was already installed.
    _default_guard: Option<tracing::subscriber::DefaultGuard>,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub(crate) fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder).expect("metrics recorder already installed");

        let upkeep_handle = handle.clone();
        PROM_UPKEEP_THREAD.get_or_init(|| {
            spawn_thread("prometheus-upkeep", move || {
                loop {
                    thread::sleep(Duration::from_secs(5));
                    upkeep_handle.run_upkeep();
                }
            })
            .expect("failed to spawn prometheus upkeep thread")
        });

        describe_monitor_metrics();
        handle
    })
}

fn describe_monitor_metrics() {
    use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

    describe_counter!("monitor_capture_frames_total", "Frames read from the camera");
    describe_counter!("monitor_capture_read_failures_total", "Failed frame reads");
    describe_counter!("monitor_capture_reopens_total", "Successful device opens");
    describe_counter!(
        "monitor_capture_open_failures_total",
        "Open attempts where every backend candidate failed"
    );
    describe_histogram!(
        "monitor_capture_frame_interval_seconds",
        Unit::Seconds,
        "Time between capture iterations"
    );
    describe_counter!("monitor_analysis_ticks_total", "Group ticks published");
    describe_counter!(
        "monitor_analysis_errors_total",
        "Analyzer failures, including panics"
    );
    describe_gauge!("monitor_analysis_faces", "Engaged faces in the last tick");
    describe_gauge!("monitor_cognitive_load", "Cognitive load of the last tick");
    describe_histogram!(
        "monitor_analysis_seconds",
        Unit::Seconds,
        "Inference plus aggregation time per sample"
    );
    describe_counter!("monitor_stream_chunks_total", "MJPEG chunks sent to viewers");
    describe_counter!(
        "monitor_stream_encode_errors_total",
        "Frames skipped because JPEG encoding failed"
    );
    describe_gauge!("monitor_stream_viewers", "Connected MJPEG viewers");
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Install the tracing subscriber for the monitor run.
pub(crate) fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer_opt, chrome_guard) = if let Some(path) = opts.chrome_trace_path.as_ref() {
        match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                tracing::warn!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());

    let dispatch = match chrome_layer_opt {
        Some(chrome) => Dispatch::new(
            tracing_subscriber::registry()
                .with(chrome.with_filter(span_only_filter))
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_timer(fmt::time::uptime())
                        .with_filter(env_filter),
                )
                .with(tracing_error::ErrorLayer::default()),
        ),
        None => Dispatch::new(
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_timer(fmt::time::uptime())
                        .with_filter(env_filter),
                )
                .with(tracing_error::ErrorLayer::default()),
        ),
    };

    TelemetryGuard {
        _default_guard: install_dispatch(dispatch),
        _chrome_guard: chrome_guard,
    }
}

/// Install `dispatch` process-wide so threads we do not spawn (HTTP workers,
/// blocking pools) log too. Falls back to the current thread when a global
/// subscriber already exists.
fn install_dispatch(dispatch: Dispatch) -> Option<tracing::subscriber::DefaultGuard> {
    match tracing::dispatcher::set_global_default(dispatch.clone()) {
        Ok(()) => None,
        Err(_) => {
            tracing::debug!("global subscriber already set; scoping telemetry to this thread");
            Some(tracing::dispatcher::set_default(&dispatch))
        }
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> Result<
    (
        tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
        tracing_chrome::FlushGuard,
    ),
    std::io::Error,
> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use tracing::subscriber::NoSubscriber;

    use super::*;

    #[test]
    fn runtime_subscriber_reaches_threads_it_did_not_spawn() {
        let _guard = enter_runtime(&TelemetryOptions::default());
        let has_subscriber = thread::spawn(|| {
            tracing::dispatcher::get_default(|current| !current.is::<NoSubscriber>())
        })
        .join()
        .unwrap();
        assert!(has_subscriber);
    }
}
