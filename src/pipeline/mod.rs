pub mod cache;
pub mod host;
pub mod monitor;
pub mod supervisor;

pub use cache::{CachedFrame, FrameCache, STALE_AFTER};
pub use host::{ChildOutput, ChildProcess, CommandSpec, ProcessHost, SystemHost};
pub use monitor::{MonitorExit, OutputMonitor, FATAL_PATTERNS};
pub use supervisor::{PipelineStatus, ProcessKind, ProcessState, ProcessSupervisor};

/// Pipeline teardown, invoked by monitors and the frame reader when they give up.
/// Implementations must tolerate repeated and concurrent calls.
pub trait Teardown: Send + Sync {
    fn cleanup(&self);
}
