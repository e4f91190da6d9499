//! OpenCV-backed camera access.

use anyhow::anyhow;
use opencv::{
    core::{Mat, MatTraitConst, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};

use crate::{
    backend::{BackendCandidate, CaptureDevice, DeviceBackend},
    types::{CaptureError, CaptureSettings, Frame, FrameFormat, NegotiatedFormat},
};

/// Opens local cameras through OpenCV's `videoio` module.
#[derive(Clone, Debug, Default)]
pub struct OpenCvBackend;

impl OpenCvBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for OpenCvBackend {
    type Device = OpenCvDevice;

    fn candidates(&self) -> Vec<BackendCandidate> {
        let mut candidates = Vec::with_capacity(3);
        if cfg!(target_os = "linux") {
            candidates.push(BackendCandidate {
                name: "v4l2",
                id: videoio::CAP_V4L2,
            });
        } else if cfg!(target_os = "windows") {
            candidates.push(BackendCandidate {
                name: "dshow",
                id: videoio::CAP_DSHOW,
            });
            candidates.push(BackendCandidate {
                name: "msmf",
                id: videoio::CAP_MSMF,
            });
        } else if cfg!(target_os = "macos") {
            candidates.push(BackendCandidate {
                name: "avfoundation",
                id: videoio::CAP_AVFOUNDATION,
            });
        }
        candidates.push(BackendCandidate {
            name: "any",
            id: videoio::CAP_ANY,
        });
        candidates
    }

    fn open(&self, index: i32, candidate: BackendCandidate) -> Result<OpenCvDevice, CaptureError> {
        if index < 0 {
            return Err(CaptureError::Open { index });
        }
        let cap = VideoCapture::new(index, candidate.id).map_err(|err| {
            debug!(
                "video-ingest: failed to open device #{index} with backend {}: {err}",
                candidate.name
            );
            CaptureError::Backend {
                index,
                backend: candidate.name,
            }
        })?;
        let opened = cap
            .is_opened()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !opened {
            return Err(CaptureError::Backend {
                index,
                backend: candidate.name,
            });
        }
        Ok(OpenCvDevice {
            cap,
            scratch: Mat::default(),
        })
    }
}

/// Open OpenCV capture handle plus the scratch matrix reads land in.
pub struct OpenCvDevice {
    cap: VideoCapture,
    scratch: Mat,
}

impl CaptureDevice for OpenCvDevice {
    fn apply(&mut self, settings: &CaptureSettings) -> NegotiatedFormat {
        let mut fourcc_set = false;
        if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
            if matches!(self.cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
                fourcc_set = true;
            }
        }
        if !fourcc_set {
            if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
                let _ = self.cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
            }
        }
        let _ = self.cap.set(
            videoio::CAP_PROP_FRAME_WIDTH,
            settings.resolution.width as f64,
        );
        let _ = self.cap.set(
            videoio::CAP_PROP_FRAME_HEIGHT,
            settings.resolution.height as f64,
        );
        let _ = self.cap.set(videoio::CAP_PROP_FPS, settings.fps);

        let negotiated = NegotiatedFormat {
            width: self.cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or_default(),
            height: self.cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or_default(),
            fps: self.cap.get(videoio::CAP_PROP_FPS).unwrap_or_default(),
        };
        if negotiated.width as i32 != settings.resolution.width
            || negotiated.height as i32 != settings.resolution.height
        {
            warn!(
                "video-ingest: requested {} but device negotiated {}x{}",
                settings.resolution, negotiated.width, negotiated.height
            );
        }
        negotiated
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let ok = self
            .cap
            .read(&mut self.scratch)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !ok {
            return Err(CaptureError::EmptyFrame);
        }
        let size = self
            .scratch
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::EmptyFrame);
        }
        if self.scratch.channels() != 3 {
            return Err(CaptureError::Other(anyhow!(
                "unexpected channel count {}",
                self.scratch.channels()
            )));
        }

        let data = self
            .scratch
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame {
            data,
            width: size.width,
            height: size.height,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn release(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!("video-ingest: failed to release capture handle: {err}");
        }
    }
}
