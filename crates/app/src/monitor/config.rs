use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use serde::{Deserialize, Serialize};
use video_ingest::Resolution;

use crate::monitor::{
    analysis::AnalysisPolicy, capture::CapturePolicy, distribution::StreamPolicy,
};

/// Academic context copied verbatim onto every raw metric row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default, alias = "level")]
    pub teaching_level: Option<String>,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub temperature: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerOptions {
    pub bind: String,
    pub port: u16,
}

#[derive(Args, Clone, Debug)]
pub struct MonitorCliArgs {
    /// Camera ordinal or /dev/videoN path.
    #[arg(long, default_value = "0")]
    pub camera: String,
    /// Requested capture size.
    #[arg(long, default_value = "640x480")]
    pub resolution: String,
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,
    #[arg(long, default_value_t = 5001)]
    pub port: u16,
    /// Directory for per-session CSV files.
    #[arg(long, env = "CSV_DIR", default_value = "emotions")]
    pub csv_dir: PathBuf,
    #[arg(long)]
    pub level: Option<String>,
    #[arg(long)]
    pub grade: Option<String>,
    #[arg(long)]
    pub subject: Option<String>,
    #[arg(long)]
    pub temperature: Option<String>,
    #[arg(long, default_value_t = 30.0)]
    pub capture_fps: f64,
    /// Failed reads before the device is reopened. Defaults to one second of frames.
    #[arg(long)]
    pub failure_threshold: Option<u32>,
    #[arg(long, default_value_t = 500)]
    pub analysis_interval_ms: u64,
    /// Minimum dominant-emotion score (0-100) for a face to count.
    #[arg(long, default_value_t = 70.0)]
    pub engaged_threshold: f32,
    #[arg(long, default_value_t = 30.0)]
    pub stream_fps: f64,
    #[arg(long, default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Number of device indices scanned by /api/camera/test.
    #[arg(long, default_value_t = 10)]
    pub probe_max: i32,
    /// Do not start capturing until POST /api/monitor/start.
    #[arg(long)]
    pub no_autostart: bool,
    /// Write a Chrome trace of all spans to this path.
    #[arg(long)]
    pub chrome_trace: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub camera_index: i32,
    pub resolution: Resolution,
    pub server: ServerOptions,
    pub csv_dir: PathBuf,
    pub session: SessionContext,
    pub capture: CapturePolicy,
    pub analysis: AnalysisPolicy,
    pub stream: StreamPolicy,
    pub probe_max: i32,
    pub autostart: bool,
    pub telemetry: TelemetryOptions,
}

impl TryFrom<MonitorCliArgs> for MonitorConfig {
    type Error = anyhow::Error;

    fn try_from(args: MonitorCliArgs) -> Result<Self> {
        let camera_index = video_ingest::parse_device_index(args.camera.trim())
            .ok_or_else(|| anyhow!("--camera must be an index or /dev/videoN, got {:?}", args.camera))?;
        let resolution = args
            .resolution
            .parse::<Resolution>()
            .with_context(|| format!("--resolution {:?}", args.resolution))?;

        if !(args.capture_fps.is_finite() && args.capture_fps > 0.0) {
            bail!("--capture-fps must be positive");
        }
        if !(args.stream_fps.is_finite() && args.stream_fps > 0.0) {
            bail!("--stream-fps must be positive");
        }
        if args.failure_threshold == Some(0) {
            bail!("--failure-threshold must be at least 1");
        }
        if args.analysis_interval_ms == 0 {
            bail!("--analysis-interval-ms must be at least 1");
        }
        if !(0.0..=100.0).contains(&args.engaged_threshold) {
            bail!("--engaged-threshold must be between 0 and 100");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.probe_max < 1 {
            bail!("--probe-max must be at least 1");
        }

        let mut capture = CapturePolicy::with_fps(args.capture_fps);
        if let Some(threshold) = args.failure_threshold {
            capture.failure_threshold = threshold;
        }

        let analysis = AnalysisPolicy {
            interval: Duration::from_millis(args.analysis_interval_ms),
            engaged_threshold: args.engaged_threshold,
            ..AnalysisPolicy::default()
        };

        let stream = StreamPolicy {
            fps: args.stream_fps,
            jpeg_quality: args.jpeg_quality,
            ..StreamPolicy::default()
        };

        Ok(Self {
            camera_index,
            resolution,
            server: ServerOptions {
                bind: args.bind,
                port: args.port,
            },
            csv_dir: args.csv_dir,
            session: SessionContext {
                teaching_level: args.level,
                grade: args.grade,
                subject: args.subject,
                temperature: args.temperature,
            },
            capture,
            analysis,
            stream,
            probe_max: args.probe_max,
            autostart: !args.no_autostart,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: MonitorCliArgs,
    }

    fn parse(extra: &[&str]) -> Result<MonitorConfig> {
        let argv = std::iter::once("classroom-monitor").chain(extra.iter().copied());
        let cli = TestCli::try_parse_from(argv)?;
        MonitorConfig::try_from(cli.args)
    }

    #[test]
    fn defaults_match_classroom_setup() {
        let config = parse(&["--csv-dir", "out"]).unwrap();
        assert_eq!(config.camera_index, 0);
        assert_eq!(config.resolution, Resolution::new(640, 480));
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.capture.failure_threshold, 30);
        assert_eq!(config.analysis.interval, Duration::from_millis(500));
        assert_eq!(config.analysis.engaged_threshold, 70.0);
        assert_eq!(config.stream.jpeg_quality, 85);
        assert_eq!(config.probe_max, 10);
        assert!(config.autostart);
        assert_eq!(config.session, SessionContext::default());
    }

    #[test]
    fn accepts_device_paths_and_session_fields() {
        let config = parse(&[
            "--camera",
            "/dev/video2",
            "--resolution",
            "1280x720",
            "--subject",
            "History",
            "--grade",
            "3B",
            "--capture-fps",
            "15",
            "--no-autostart",
        ])
        .unwrap();
        assert_eq!(config.camera_index, 2);
        assert_eq!(config.resolution, Resolution::new(1280, 720));
        assert_eq!(config.session.subject.as_deref(), Some("History"));
        assert_eq!(config.capture.failure_threshold, 15);
        assert!(!config.autostart);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse(&["--resolution", "wide"]).is_err());
        assert!(parse(&["--jpeg-quality", "0"]).is_err());
        assert!(parse(&["--engaged-threshold", "120"]).is_err());
        assert!(parse(&["--capture-fps", "0"]).is_err());
        assert!(parse(&["--camera", "rtsp://cam"]).is_err());
        assert!(parse(&["--failure-threshold", "0"]).is_err());
    }

    #[test]
    fn session_context_accepts_short_level_key() {
        let ctx: SessionContext =
            serde_json::from_str(r#"{"level":"Primary","subject":"Art"}"#).unwrap();
        assert_eq!(ctx.teaching_level.as_deref(), Some("Primary"));
        assert_eq!(ctx.subject.as_deref(), Some("Art"));
        assert!(ctx.grade.is_none());
    }
}
