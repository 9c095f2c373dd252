use bytes::Bytes;
use serde::{Deserialize, Serialize};
use v4l::FourCC;

use crate::error::CaptureError;

/// Decoded frame ready for serving. Cheap to clone, the pixel data is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,
    pub meta: FrameMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Yuyv4,
    Mjpeg,
    /// Planar YUV 4:2:0, what `ffmpeg -pix_fmt yuv420p -f v4l2` writes
    Yu12,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Result<Self, CaptureError> {
        match &fourcc.repr {
            b"RGB3" => Ok(Self::Rgb24),
            b"YUYV" => Ok(Self::Yuyv4),
            b"MJPG" => Ok(Self::Mjpeg),
            b"YU12" => Ok(Self::Yu12),
            _ => Err(CaptureError::UnsupportedFormat(fourcc.to_string())),
        }
    }
}

impl Frame {
    pub fn rgb(sequence: u64, width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            meta: FrameMetadata {
                sequence,
                width,
                height,
                format: PixelFormat::Rgb24,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_loopback_fourccs() {
        assert_eq!(
            PixelFormat::from_fourcc(FourCC::new(b"YU12")).unwrap(),
            PixelFormat::Yu12
        );
        assert_eq!(
            PixelFormat::from_fourcc(FourCC::new(b"MJPG")).unwrap(),
            PixelFormat::Mjpeg
        );
        assert!(matches!(
            PixelFormat::from_fourcc(FourCC::new(b"NV12")),
            Err(CaptureError::UnsupportedFormat(_))
        ));
    }
}
