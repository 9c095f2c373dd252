//! Diagnostic stream watcher, one per supervised process

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use super::supervisor::ProcessKind;
use super::Teardown;
use crate::error::PipelineError;

/// Substrings that mean the capture pipeline cannot recover.
pub const FATAL_PATTERNS: [&str; 2] = ["Invalid data found", "Could not find the requested device"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Stream closed, usually because the process exited
    StreamEnded,
    /// A fatal line was seen and teardown was requested
    Fatal(String),
}

pub fn is_fatal(line: &str) -> bool {
    FATAL_PATTERNS.iter().any(|pattern| line.contains(pattern))
}

pub struct OutputMonitor {
    kind: ProcessKind,
    teardown: Arc<dyn Teardown>,
}

impl OutputMonitor {
    pub fn new(kind: ProcessKind, teardown: Arc<dyn Teardown>) -> Self {
        Self { kind, teardown }
    }

    pub fn spawn(self, stream: Box<dyn Read + Send>) -> Result<JoinHandle<MonitorExit>, PipelineError> {
        let name = format!("{}-monitor", self.kind);
        thread::Builder::new()
            .name(name)
            .spawn(move || self.watch(BufReader::new(stream)))
            .map_err(|e| PipelineError::Thread("monitor", e))
    }

    /// Blocking line loop; returns once the stream ends or a fatal line is seen.
    pub fn watch<R: BufRead>(&self, mut reader: R) -> MonitorExit {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("{} output unreadable: {}", self.kind, e);
                    break;
                }
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if is_fatal(line) {
                error!("{} output: {}", self.kind, line);
                error!("{} encountered a critical error. Shutting down.", self.kind);
                metrics::counter!("camrelay_fatal_diagnostics").increment(1);
                self.teardown.cleanup();
                return MonitorExit::Fatal(line.to_owned());
            }
            info!("{} output: {}", self.kind, line);
        }

        info!("{} output closed", self.kind);
        MonitorExit::StreamEnded
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingTeardown(AtomicUsize);

    impl Teardown for CountingTeardown {
        fn cleanup(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor() -> (OutputMonitor, Arc<CountingTeardown>) {
        let teardown = Arc::new(CountingTeardown::default());
        (OutputMonitor::new(ProcessKind::Converter, teardown.clone()), teardown)
    }

    #[test]
    fn each_fatal_pattern_triggers_one_cleanup() {
        for pattern in FATAL_PATTERNS {
            let (monitor, teardown) = monitor();
            let input = format!(
                "frame=  10 fps=5.0\npipe:: {}: something\n{} again\nafter\n",
                pattern, pattern
            );

            let exit = monitor.watch(Cursor::new(input));

            assert_eq!(exit, MonitorExit::Fatal(format!("pipe:: {}: something", pattern)));
            assert_eq!(teardown.0.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn informational_lines_never_clean_up() {
        let (monitor, teardown) = monitor();
        let input = "Input #0, mpjpeg, from 'pipe:':\n\ninvalid data found\nStream mapping:\n";

        assert_eq!(monitor.watch(Cursor::new(input)), MonitorExit::StreamEnded);
        assert_eq!(teardown.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn non_utf8_output_is_tolerated() {
        let (monitor, teardown) = monitor();
        let mut input = vec![0xFF, 0xFE, b'\n'];
        input.extend_from_slice(b"Could not find the requested device\n");

        assert!(matches!(
            monitor.watch(Cursor::new(input)),
            MonitorExit::Fatal(_)
        ));
        assert_eq!(teardown.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn spawned_monitor_is_joinable() {
        let (monitor, teardown) = monitor();
        let handle = monitor
            .spawn(Box::new(Cursor::new(b"*** Error: Could not find the requested device\n".to_vec())))
            .unwrap();

        assert!(matches!(handle.join().unwrap(), MonitorExit::Fatal(_)));
        assert_eq!(teardown.0.load(Ordering::SeqCst), 1);
    }
}
