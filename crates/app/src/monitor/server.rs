//! Actix Web control surface: MJPEG preview, camera control, live updates.
//!
//! The server runs on a dedicated thread so the capture and analysis threads
//! never share a runtime with HTTP handlers. Every viewer gets its own
//! [`FrameGenerator`] ticked by an interval on the server runtime; encoding
//! and device work run on the blocking pool so workers stay responsive.

use std::{sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use serde::{Deserialize, Serialize};
use serde_json::to_string;
use tokio::sync::{broadcast::error::RecvError, oneshot};
use tracing::{error, info, warn};
use video_ingest::Resolution;

use crate::monitor::{
    config::{ServerOptions, SessionContext},
    distribution::GeneratorStep,
    pipeline::{LoopStatus, MonitorControl},
    state::DeviceSnapshot,
    telemetry,
};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Handle for the control server thread.
pub(crate) struct ControlServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ControlServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Bind the server on its own thread; returns once the socket is bound.
pub(crate) fn spawn_control_server(
    control: Arc<dyn MonitorControl>,
    options: &ServerOptions,
) -> Result<ControlServer> {
    let address = (options.bind.clone(), options.port);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::io::Result<()>>(1);

    let handle = telemetry::spawn_thread("monitor-control-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let data = web::Data::from(control);
            let server = match HttpServer::new(move || {
                App::new().app_data(data.clone()).configure(routes)
            })
            .bind(address)
            {
                Ok(server) => server.run(),
                Err(err) => {
                    let _ = ready_tx.send(Err(std::io::Error::new(err.kind(), err.to_string())));
                    return Err(err);
                }
            };
            let _ = ready_tx.send(Ok(()));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn control server thread")?;

    ready_rx
        .recv()
        .map_err(|_| anyhow!("control server thread exited before binding"))?
        .with_context(|| format!("Failed to bind {}:{}", options.bind, options.port))?;
    info!("Control server listening on {}:{}", options.bind, options.port);

    Ok(ControlServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz))
        .route("/video_feed", web::get().to(video_feed))
        .route("/stream.mjpg", web::get().to(video_feed))
        .route("/api/camera/info", web::get().to(camera_info))
        .route("/api/camera/test", web::get().to(camera_test))
        .route("/api/camera/config", web::post().to(camera_config))
        .route("/api/session", web::post().to(set_session))
        .route("/api/monitor/start", web::post().to(monitor_start))
        .route("/api/monitor/stop", web::post().to(monitor_stop))
        .route("/api/emotions/latest", web::get().to(latest_emotions))
        .route("/events", web::get().to(events))
        .route("/metrics", web::get().to(metrics_handler));
}

#[derive(Serialize)]
struct CameraInfo {
    #[serde(flatten)]
    snapshot: DeviceSnapshot,
    loops: LoopStatus,
}

#[derive(Serialize)]
struct CameraTest {
    devices: Vec<i32>,
    #[serde(flatten)]
    snapshot: DeviceSnapshot,
}

#[derive(Debug, Deserialize)]
struct CameraConfigRequest {
    index: i32,
    resolution: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn healthz() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("ok")
}

/// Stream the MJPEG preview; one generator per connection.
async fn video_feed(control: web::Data<dyn MonitorControl>) -> HttpResponse {
    let mut generator = control.frame_generator();
    let period = generator.frame_interval();
    let stream = stream! {
        let viewer = ViewerGauge::connect();
        let mut interval = actix_web::rt::time::interval(period);
        loop {
            interval.tick().await;
            let span = viewer.span.clone();
            let polled = web::block(move || {
                let step = span.in_scope(|| generator.poll_chunk());
                (generator, step)
            })
            .await;
            let step = match polled {
                Ok((returned, step)) => {
                    generator = returned;
                    step
                }
                Err(err) => {
                    error!("Viewer encoder task failed: {err}");
                    break;
                }
            };
            match step {
                GeneratorStep::Finished => break,
                GeneratorStep::Skipped => continue,
                GeneratorStep::Chunk(chunk) => {
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Tracks connected viewers; the stream drops it when the client goes away.
struct ViewerGauge {
    span: tracing::Span,
}

impl ViewerGauge {
    fn connect() -> Self {
        metrics::gauge!("monitor_stream_viewers").increment(1.0);
        Self {
            span: tracing::info_span!("stream.viewer"),
        }
    }
}

impl Drop for ViewerGauge {
    fn drop(&mut self) {
        metrics::gauge!("monitor_stream_viewers").decrement(1.0);
    }
}

async fn camera_info(control: web::Data<dyn MonitorControl>) -> HttpResponse {
    HttpResponse::Ok().json(CameraInfo {
        snapshot: control.snapshot(),
        loops: control.loop_status(),
    })
}

/// Probe device indices off the async runtime; opening devices blocks.
async fn camera_test(control: web::Data<dyn MonitorControl>) -> HttpResponse {
    let probe = control.clone().into_inner();
    match web::block(move || probe.probe_devices()).await {
        Ok(devices) => HttpResponse::Ok().json(CameraTest {
            devices,
            snapshot: control.snapshot(),
        }),
        Err(err) => HttpResponse::InternalServerError().json(ErrorBody {
            error: err.to_string(),
        }),
    }
}

async fn camera_config(
    control: web::Data<dyn MonitorControl>,
    body: web::Json<CameraConfigRequest>,
) -> HttpResponse {
    let CameraConfigRequest { index, resolution } = body.into_inner();
    let resolution = resolution.unwrap_or_else(|| Resolution::default().to_string());
    control.configure(index, &resolution);
    HttpResponse::Ok().json(control.snapshot())
}

async fn set_session(
    control: web::Data<dyn MonitorControl>,
    body: web::Json<SessionContext>,
) -> HttpResponse {
    let context = body.into_inner();
    control.set_session_context(context.clone());
    HttpResponse::Ok().json(context)
}

/// Starting may join old loops and open the CSV sink, so it runs off the worker.
async fn monitor_start(control: web::Data<dyn MonitorControl>) -> HttpResponse {
    let control = control.into_inner();
    let started = web::block(move || control.start())
        .await
        .map_err(|err| anyhow!("start task failed: {err}"))
        .and_then(|result| result);
    match started {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(err) => {
            error!("Failed to start monitor: {err:#}");
            HttpResponse::InternalServerError().json(ErrorBody {
                error: format!("{err:#}"),
            })
        }
    }
}

async fn monitor_stop(control: web::Data<dyn MonitorControl>) -> HttpResponse {
    control.stop();
    HttpResponse::Ok().json(control.snapshot())
}

async fn latest_emotions(control: web::Data<dyn MonitorControl>) -> HttpResponse {
    match control.live().latest() {
        Some(tick) => HttpResponse::Ok().json(tick),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream group ticks as Server-Sent Events.
async fn events(control: web::Data<dyn MonitorControl>) -> HttpResponse {
    let mut rx = control.live().subscribe();
    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        loop {
            match actix_web::rt::time::timeout(SSE_KEEP_ALIVE, rx.recv()).await {
                Err(_) => {
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": keep-alive\n\n"));
                }
                Ok(Ok(tick)) => match to_string(&tick) {
                    Ok(json) => {
                        let chunk = format!("event: emotion_update\ndata: {json}\n\n");
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                    Err(err) => {
                        let chunk = format!("event: error\ndata: {err}\n\n");
                        yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
                    }
                },
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!("SSE subscriber lagged; skipped {skipped} ticks");
                }
                Ok(Err(RecvError::Closed)) => break,
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
