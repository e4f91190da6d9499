//! JPEG encoding and multipart framing for viewer streams.

use anyhow::{Result, anyhow, bail};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use video_ingest::Frame;

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

pub(crate) fn encode_frame_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    if !frame.is_well_formed() {
        bail!(
            "frame {}x{} carries {} bytes, expected {}",
            frame.width,
            frame.height,
            frame.data.len(),
            frame.expected_len()
        );
    }
    let rgb = RgbImage::from_vec(frame.width as u32, frame.height as u32, bgr_to_rgb(&frame.data))
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;
    encode_image_jpeg(&rgb, quality)
}

pub(crate) fn encode_image_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("jpeg encode failed: {err}"))?;
    Ok(buffer)
}

/// Wrap one JPEG as a `multipart/x-mixed-replace` part.
pub(crate) fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PART_HEADER.len() + jpeg.len() + 2);
    payload.extend_from_slice(PART_HEADER);
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    payload
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}
