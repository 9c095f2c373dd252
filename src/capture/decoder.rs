//! Conversion of raw loopback buffers to RGB24 and of RGB24 frames to JPEG

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::PixelFormat;
use crate::error::CaptureError;

pub const JPEG_QUALITY: u8 = 85;

/// Decode a raw device buffer into packed RGB24 of exactly `width * height`
/// pixels.
pub fn decode_frame(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>, CaptureError> {
    let (w, h) = (width as usize, height as usize);
    let rgb = match format {
        PixelFormat::Rgb24 => {
            let expected = w * h * 3;
            ensure_len(data, expected)?;
            Ok(data[..expected].to_vec())
        }
        PixelFormat::Yuyv4 => yuyv_to_rgb(data, w, h),
        PixelFormat::Yu12 => yu12_to_rgb(data, w, h),
        PixelFormat::Mjpeg => mjpeg_to_rgb(data, width, height),
    }?;
    ensure_rgb_len(&rgb, width, height)?;
    Ok(rgb)
}

/// Encode an RGB24 buffer as a baseline JPEG.
pub fn encode_jpeg(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    // the encoder panics on a length mismatch
    ensure_rgb_len(rgb, width, height)?;

    let mut out = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode(
        rgb,
        width,
        height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), CaptureError> {
    if data.len() < expected {
        return Err(CaptureError::ShortFrame {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn ensure_rgb_len(rgb: &[u8], width: u32, height: u32) -> Result<(), CaptureError> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(CaptureError::ShortFrame {
            expected,
            actual: rgb.len(),
        });
    }
    Ok(())
}

fn mjpeg_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| CaptureError::UnsupportedFormat("MJPEG without header".into()))?;

    let actual = (u32::from(info.width), u32::from(info.height));
    if actual != (width, height) {
        return Err(CaptureError::SizeMismatch {
            expected: (width, height),
            actual,
        });
    }

    match info.pixel_format {
        JpegPixelFormat::RGB24 => Ok(pixels),
        JpegPixelFormat::L8 => Ok(pixels.iter().flat_map(|&l| [l, l, l]).collect()),
        other => Err(CaptureError::UnsupportedFormat(format!("MJPEG {:?}", other))),
    }
}

fn yuyv_to_rgb(data: &[u8], w: usize, h: usize) -> Result<Vec<u8>, CaptureError> {
    if w % 2 != 0 {
        return Err(CaptureError::UnsupportedFormat(format!("YUYV with odd width {}", w)));
    }
    let expected = w * h * 2;
    ensure_len(data, expected)?;

    let mut rgb = Vec::with_capacity(w * h * 3);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn yu12_to_rgb(data: &[u8], w: usize, h: usize) -> Result<Vec<u8>, CaptureError> {
    let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
    let luma = w * h;
    let chroma = cw * ch;
    ensure_len(data, luma + 2 * chroma)?;

    let (y_plane, rest) = data.split_at(luma);
    let (u_plane, v_plane) = rest.split_at(chroma);

    let mut rgb = Vec::with_capacity(luma * 3);
    for row in 0..h {
        for col in 0..w {
            let c = (row / 2) * cw + col / 2;
            rgb.extend_from_slice(&yuv_to_rgb(y_plane[row * w + col], u_plane[c], v_plane[c]));
        }
    }
    Ok(rgb)
}

// BT.601 limited range
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| (x >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e + 128),
        clamp(298 * c - 100 * d - 208 * e + 128),
        clamp(298 * c + 516 * d + 128),
    ]
}
