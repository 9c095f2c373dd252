//! Frame reader: pulls frames from the loopback device into the frame cache

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::error::{CaptureError, PipelineError};
use crate::pipeline::{FrameCache, Teardown};
use crate::RetryConfig;

/// An opened capture device.
pub trait FrameSource {
    /// `Ok(None)` is a soft failure: the device is open but had no frame ready.
    /// `Err` is a hard failure and ends the reader.
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

/// Opens a fresh [`FrameSource`]; called again after every failed open.
pub trait SourceOpener: Send + 'static {
    type Source: FrameSource;

    fn open(&mut self) -> Result<Self::Source, CaptureError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub open_threshold: u32,
    pub open_backoff: Duration,
    pub read_threshold: u32,
    pub read_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            open_threshold: 5,
            open_backoff: Duration::from_secs(2),
            read_threshold: 500,
            read_interval: Duration::from_millis(100),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            open_threshold: config.open_threshold,
            open_backoff: config.open_backoff(),
            read_threshold: config.read_threshold,
            read_interval: config.read_interval(),
        }
    }
}

/// Why a reader run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    OpenRetriesExhausted { attempts: u32 },
    ReadRetriesExhausted { attempts: u32 },
    HardFailure,
    Stopped,
}

pub struct FrameReader<O: SourceOpener> {
    opener: O,
    cache: Arc<FrameCache>,
    teardown: Arc<dyn Teardown>,
    policy: RetryPolicy,
    stop: Arc<AtomicBool>,
}

impl<O: SourceOpener> FrameReader<O> {
    pub fn new(
        opener: O,
        cache: Arc<FrameCache>,
        teardown: Arc<dyn Teardown>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            opener,
            cache,
            teardown,
            policy,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<ReaderHandle, PipelineError> {
        let stop = Arc::clone(&self.stop);
        let thread = thread::Builder::new()
            .name("frame-reader".into())
            .spawn(move || self.run())
            .map_err(|e| PipelineError::Thread("frame-reader", e))?;
        Ok(ReaderHandle { stop, thread })
    }

    /// Blocking read loop. Always tears the pipeline down before returning.
    pub fn run(mut self) -> ReaderExit {
        let exit = self.read_loop();
        match exit {
            ReaderExit::Stopped => info!("Frame reader stopped"),
            other => error!("Frame reader terminated: {:?}", other),
        }
        self.teardown.cleanup();
        exit
    }

    fn read_loop(&mut self) -> ReaderExit {
        let mut open_retries = 0u32;
        let mut read_retries = 0u32;

        let mut source = loop {
            if self.stopped() {
                return ReaderExit::Stopped;
            }
            match self.opener.open() {
                Ok(source) => break source,
                Err(e) => {
                    open_retries += 1;
                    warn!("Camera connection lost, retrying ({}): {}", open_retries, e);
                    if open_retries > self.policy.open_threshold {
                        error!("Failed to reconnect to the camera after {} attempts", open_retries);
                        return ReaderExit::OpenRetriesExhausted {
                            attempts: open_retries,
                        };
                    }
                    thread::sleep(self.policy.open_backoff);
                }
            }
        };
        info!("Capture device opened after {} retries", open_retries);

        loop {
            if self.stopped() {
                return ReaderExit::Stopped;
            }
            match source.read_frame() {
                Ok(Some(frame)) => {
                    debug!("Frame {} captured", frame.meta.sequence);
                    self.cache.publish(frame, Instant::now());
                    metrics::counter!("camrelay_frames_published").increment(1);
                    read_retries = 0;
                }
                Ok(None) => {
                    read_retries += 1;
                    metrics::counter!("camrelay_frame_read_retries").increment(1);
                    if read_retries > self.policy.read_threshold {
                        error!("Camera read failure, terminating frame reader");
                        return ReaderExit::ReadRetriesExhausted {
                            attempts: read_retries,
                        };
                    }
                    warn!("Failed to read frame, camera may be disconnected");
                }
                Err(e) => {
                    error!("Unexpected error in frame reader: {}", e);
                    return ReaderExit::HardFailure;
                }
            }
            thread::sleep(self.policy.read_interval);
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Handle to a spawned reader thread.
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<ReaderExit>,
}

impl ReaderHandle {
    /// Ask the loop to exit at its next iteration and wait for it.
    pub fn stop(self) -> Option<ReaderExit> {
        self.stop.store(true, Ordering::SeqCst);
        self.thread.join().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct CountingTeardown(AtomicUsize);

    impl Teardown for CountingTeardown {
        fn cleanup(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingTeardown {
        fn calls(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    enum Step {
        Frame,
        Empty,
        Fail,
    }

    struct ScriptedSource {
        steps: VecDeque<Step>,
        sequence: u64,
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            match self.steps.pop_front() {
                Some(Step::Frame) => {
                    self.sequence += 1;
                    Ok(Some(Frame::rgb(self.sequence, 1, 1, vec![1, 2, 3])))
                }
                Some(Step::Empty) | None => Ok(None),
                Some(Step::Fail) => Err(CaptureError::Io(io::Error::other("EIO"))),
            }
        }
    }

    struct ScriptedOpener {
        failures: u32,
        steps: Option<VecDeque<Step>>,
    }

    impl SourceOpener for ScriptedOpener {
        type Source = ScriptedSource;

        fn open(&mut self) -> Result<ScriptedSource, CaptureError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(CaptureError::NotCapture("/dev/video0".into()));
            }
            Ok(ScriptedSource {
                steps: self.steps.take().unwrap_or_default(),
                sequence: 0,
            })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            open_backoff: Duration::ZERO,
            read_interval: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    fn reader(opener: ScriptedOpener) -> (FrameReader<ScriptedOpener>, Arc<FrameCache>, Arc<CountingTeardown>) {
        let cache = Arc::new(FrameCache::new());
        let teardown = Arc::new(CountingTeardown::default());
        let reader = FrameReader::new(opener, Arc::clone(&cache), teardown.clone(), fast_policy());
        (reader, cache, teardown)
    }

    #[test]
    fn six_failed_opens_stop_the_reader() {
        let (reader, cache, teardown) = reader(ScriptedOpener {
            failures: 6,
            steps: None,
        });

        assert_eq!(
            reader.run(),
            ReaderExit::OpenRetriesExhausted { attempts: 6 }
        );
        assert_eq!(teardown.calls(), 1);
        assert!(cache.snapshot().is_none());
    }

    #[test]
    fn five_failed_opens_still_recover() {
        let steps = VecDeque::from([Step::Frame, Step::Fail]);
        let (reader, cache, teardown) = reader(ScriptedOpener {
            failures: 5,
            steps: Some(steps),
        });

        assert_eq!(reader.run(), ReaderExit::HardFailure);
        assert_eq!(teardown.calls(), 1);
        assert_eq!(cache.snapshot().unwrap().frame.meta.sequence, 1);
    }

    #[test]
    fn soft_failures_past_threshold_stop_the_reader() {
        let (reader, _cache, teardown) = reader(ScriptedOpener {
            failures: 0,
            steps: Some((0..501).map(|_| Step::Empty).collect()),
        });

        assert_eq!(
            reader.run(),
            ReaderExit::ReadRetriesExhausted { attempts: 501 }
        );
        assert_eq!(teardown.calls(), 1);
    }

    #[test]
    fn successful_read_resets_soft_failure_budget() {
        // 499 misses, a frame, then 500 more misses: still under budget
        let mut steps: VecDeque<Step> = (0..499).map(|_| Step::Empty).collect();
        steps.push_back(Step::Frame);
        steps.extend((0..500).map(|_| Step::Empty));
        steps.push_back(Step::Frame);
        steps.push_back(Step::Fail);

        let (reader, cache, teardown) = reader(ScriptedOpener {
            failures: 0,
            steps: Some(steps),
        });

        assert_eq!(reader.run(), ReaderExit::HardFailure);
        assert_eq!(cache.snapshot().unwrap().frame.meta.sequence, 2);
        assert_eq!(teardown.calls(), 1);
    }

    #[test]
    fn hard_failure_does_not_retry() {
        let (reader, cache, teardown) = reader(ScriptedOpener {
            failures: 0,
            steps: Some(VecDeque::from([Step::Fail, Step::Frame])),
        });

        assert_eq!(reader.run(), ReaderExit::HardFailure);
        assert!(cache.snapshot().is_none());
        assert_eq!(teardown.calls(), 1);
    }

    #[test]
    fn stop_signal_ends_the_loop_and_cleans_up() {
        let cache = Arc::new(FrameCache::new());
        let teardown = Arc::new(CountingTeardown::default());
        let policy = RetryPolicy {
            read_threshold: u32::MAX,
            read_interval: Duration::from_millis(1),
            ..fast_policy()
        };
        let opener = ScriptedOpener {
            failures: 0,
            steps: None,
        };
        let handle = FrameReader::new(opener, cache, teardown.clone(), policy)
            .spawn()
            .unwrap();

        assert_eq!(handle.stop(), Some(ReaderExit::Stopped));
        assert_eq!(teardown.calls(), 1);
    }
}
