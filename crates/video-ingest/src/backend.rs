//! Contract between the capture loop and whatever talks to the hardware.

use crate::types::{CaptureError, CaptureSettings, Frame, NegotiatedFormat};

/// One device-access strategy tried while opening a camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendCandidate {
    pub name: &'static str,
    pub id: i32,
}

/// Opens capture devices by ordinal.
///
/// Implementations must turn bad indices into errors; the capture loop retries
/// every iteration and relies on `open` never panicking.
pub trait DeviceBackend: Send + 'static {
    type Device: CaptureDevice;

    /// Candidates in priority order.
    fn candidates(&self) -> Vec<BackendCandidate>;

    fn open(&self, index: i32, candidate: BackendCandidate) -> Result<Self::Device, CaptureError>;

    /// Return the indices in `0..max_index` that open with any candidate.
    fn probe(&self, max_index: i32) -> Vec<i32> {
        self.probe_except(max_index, None)
    }

    /// Like [`probe`](Self::probe), but reports `held` as present without
    /// opening it a second time.
    fn probe_except(&self, max_index: i32, held: Option<i32>) -> Vec<i32> {
        let mut found = Vec::new();
        for index in 0..max_index.max(0) {
            if held == Some(index) {
                found.push(index);
                continue;
            }
            for candidate in self.candidates() {
                if let Ok(mut device) = self.open(index, candidate) {
                    device.release();
                    found.push(index);
                    break;
                }
            }
        }
        found
    }
}

/// An opened device handle. Owned by exactly one capture loop.
pub trait CaptureDevice: Send {
    /// Push the requested settings and report what the device accepted.
    fn apply(&mut self, settings: &CaptureSettings) -> NegotiatedFormat;

    /// Read one frame synchronously. The returned frame is an owned copy.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    fn release(&mut self);
}
