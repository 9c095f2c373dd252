pub mod decoder;
pub mod frame;
pub mod reader;
pub mod v4l2;

pub use frame::Frame;
pub use frame::PixelFormat;
pub use reader::{FrameReader, FrameSource, ReaderExit, ReaderHandle, RetryPolicy, SourceOpener};
pub use v4l2::{V4l2Capture, V4l2Opener};
