//! V4L2 capture from the loopback device fed by the converter process

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::Device;

use crate::capture::decoder;
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::reader::{FrameSource, SourceOpener};
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Memory-mapped V4L2 capture. Frames are decoded to RGB24 on read.
pub struct V4l2Capture {
    device: Device,
    stream: Option<MmapStream<'static>>,
    buffer_count: u32,
    timeout: Duration,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
}

impl V4l2Capture {
    /// Open the device and accept whatever format the writer negotiated.
    pub fn open(path: &Path, buffer_count: u32, timeout: Duration) -> Result<Self, CaptureError> {
        let device = Device::with_path(path).map_err(|source| CaptureError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        // With exclusive_caps=1 the loopback only advertises capture once a
        // writer is attached, so this doubles as a "converter is up" check.
        let caps = device.query_caps()?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCapture(path.to_path_buf()));
        }

        let fmt = device.format()?;
        let format = PixelFormat::from_fourcc(fmt.fourcc)?;
        info!(
            "Device: {} ({}) {}x{} {:?}",
            caps.card, caps.driver, fmt.width, fmt.height, format
        );

        Ok(Self {
            device,
            stream: None,
            buffer_count,
            timeout,
            width: fmt.width,
            height: fmt.height,
            format,
            sequence: 0,
        })
    }

    fn start_stream(&mut self) -> io::Result<&mut MmapStream<'static>> {
        if self.stream.is_none() {
            let mut stream =
                MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
            stream.set_timeout(self.timeout);
            debug!("Capture stream started with {} buffers", self.buffer_count);
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::other("stream not started"))
    }
}

impl FrameSource for V4l2Capture {
    #[instrument(skip(self))]
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let (width, height, format) = (self.width, self.height, self.format);

        let stream = self.start_stream()?;
        let dequeued = stream.next().map(|(buf, meta)| {
            let used = (meta.bytesused as usize).min(buf.len());
            Bytes::copy_from_slice(&buf[..used])
        });

        let raw = match dequeued {
            Ok(raw) if raw.is_empty() => return Ok(None),
            Ok(raw) => raw,
            Err(e) if is_soft(&e) => {
                // A timed out dequeue leaves the buffer ring out of step;
                // rebuild the stream on the next read.
                debug!("Dequeue gave no frame: {}", e);
                self.stream = None;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let rgb = decoder::decode_frame(&raw, width, height, format)?;
        self.sequence += 1;

        Ok(Some(Frame {
            data: Bytes::from(rgb),
            meta: FrameMetadata {
                sequence: self.sequence,
                width,
                height,
                format: PixelFormat::Rgb24,
            },
        }))
    }
}

fn is_soft(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Opens [`V4l2Capture`] on the configured loopback path.
pub struct V4l2Opener {
    path: PathBuf,
    buffer_count: u32,
    timeout: Duration,
}

impl V4l2Opener {
    pub fn new(config: &CaptureConfig, timeout: Duration) -> Self {
        Self {
            path: config.device.clone(),
            buffer_count: config.buffer_count,
            timeout,
        }
    }
}

impl SourceOpener for V4l2Opener {
    type Source = V4l2Capture;

    fn open(&mut self) -> Result<V4l2Capture, CaptureError> {
        V4l2Capture::open(&self.path, self.buffer_count, self.timeout)
    }
}
