//! Error types for process supervision and frame capture

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::pipeline::ProcessKind;

/// Failures of a single supervision step. Setup surfaces these to its caller;
/// cleanup logs them per step and keeps going.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to launch {kind} process `{}`: {source}", .program.display())]
    Launch {
        kind: ProcessKind,
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{kind} process has no {stream} stream")]
    MissingStream {
        kind: ProcessKind,
        stream: &'static str,
    },

    #[error("`{command}` exited with {status}")]
    Failed { command: String, status: ExitStatus },

    #[error("failed to run `{command}`: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to terminate {kind} process: {source}")]
    Terminate {
        kind: ProcessKind,
        #[source]
        source: io::Error,
    },

    #[error("failed to kill `{name}` processes: {source}")]
    KillByName {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {0} thread: {1}")]
    Thread(&'static str, #[source] io::Error),
}

/// Failures opening or reading the loopback device
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("device {} does not support video capture", .0.display())]
    NotCapture(PathBuf),

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    #[error("frame is {actual} bytes, expected {expected}")]
    ShortFrame { expected: usize, actual: usize },

    #[error("frame is {actual:?}, device negotiated {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] jpeg_decoder::Error),

    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
}
