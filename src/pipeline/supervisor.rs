//! Lifecycle of the chained source and converter processes

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::host::{ChildOutput, ChildProcess, CommandSpec, ProcessHost};
use super::monitor::{MonitorExit, OutputMonitor};
use super::Teardown;
use crate::error::PipelineError;
use crate::PipelineConfig;

const JOIN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Source,
    Converter,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Source => f.write_str("source"),
            ProcessKind::Converter => f.write_str("converter"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Terminating,
    Terminated,
}

struct SupervisedProcess {
    kind: ProcessKind,
    child: Option<Box<dyn ChildProcess>>,
    state: ProcessState,
}

impl SupervisedProcess {
    fn new(kind: ProcessKind) -> Self {
        Self {
            kind,
            child: None,
            state: ProcessState::Stopped,
        }
    }
}

struct PipelineState {
    source: SupervisedProcess,
    converter: SupervisedProcess,
    monitors_active: bool,
    monitors: Vec<JoinHandle<MonitorExit>>,
}

impl PipelineState {
    fn process_mut(&mut self, kind: ProcessKind) -> &mut SupervisedProcess {
        match kind {
            ProcessKind::Source => &mut self.source,
            ProcessKind::Converter => &mut self.converter,
        }
    }
}

/// Point-in-time view of the pipeline for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub source: ProcessState,
    pub converter: ProcessState,
    pub monitors_active: bool,
}

impl PipelineStatus {
    pub fn is_running(&self) -> bool {
        self.source == ProcessState::Running && self.converter == ProcessState::Running
    }
}

/// Owns the source and converter processes and the monitors watching them.
pub struct ProcessSupervisor {
    host: Arc<dyn ProcessHost>,
    config: PipelineConfig,
    device: PathBuf,
    state: Mutex<PipelineState>,
}

impl ProcessSupervisor {
    pub fn new(host: Arc<dyn ProcessHost>, config: PipelineConfig, device: impl Into<PathBuf>) -> Self {
        Self {
            host,
            config,
            device: device.into(),
            state: Mutex::new(PipelineState {
                source: SupervisedProcess::new(ProcessKind::Source),
                converter: SupervisedProcess::new(ProcessKind::Converter),
                monitors_active: false,
                monitors: Vec::new(),
            }),
        }
    }

    pub fn source_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.gphoto2, ["--stdout", "--capture-movie"])
    }

    pub fn converter_command(&self) -> CommandSpec {
        let device = self.device.to_string_lossy();
        CommandSpec::new(
            &self.config.ffmpeg,
            ["-i", "-", "-pix_fmt", "yuv420p", "-f", "v4l2", &*device],
        )
    }

    /// Reload the loopback module and launch source -> converter. On failure
    /// everything started so far is torn down and the error is returned.
    #[instrument(skip(self))]
    pub fn setup(self: &Arc<Self>) -> Result<(), PipelineError> {
        if self.status().monitors_active {
            warn!("Pipeline already set up, tearing it down first");
            self.cleanup();
        }

        match self.try_setup() {
            Ok(()) => {
                info!("Capture pipeline running");
                Ok(())
            }
            Err(e) => {
                error!("Error in starting camera: {}", e);
                self.cleanup();
                Err(e)
            }
        }
    }

    fn try_setup(self: &Arc<Self>) -> Result<(), PipelineError> {
        if let Err(e) = self.kill_source_by_name() {
            debug!("Stale source kill: {}", e);
        }
        if let Err(e) = self.unload_module() {
            debug!("Stale module unload: {}", e);
        }
        self.load_module()?;

        let mut source = self.launch(ProcessKind::Source, &self.source_command(), None, true)?;
        let source_stdout = source.take_stdout();
        let source_stderr = source.take_stderr();
        self.adopt(ProcessKind::Source, source);
        info!("{} process started", ProcessKind::Source);

        let stdout = source_stdout.ok_or(PipelineError::MissingStream {
            kind: ProcessKind::Source,
            stream: "stdout",
        })?;
        let mut converter =
            self.launch(ProcessKind::Converter, &self.converter_command(), Some(stdout), false)?;
        let converter_stderr = converter.take_stderr();
        self.adopt(ProcessKind::Converter, converter);
        info!("{} process started", ProcessKind::Converter);

        let mut monitors = Vec::with_capacity(2);
        for (kind, stderr) in [
            (ProcessKind::Source, source_stderr),
            (ProcessKind::Converter, converter_stderr),
        ] {
            let stderr = stderr.ok_or(PipelineError::MissingStream {
                kind,
                stream: "stderr",
            })?;
            let teardown: Arc<dyn Teardown> = self.clone();
            monitors.push(OutputMonitor::new(kind, teardown).spawn(stderr)?);
        }

        let mut state = self.lock_state();
        state.monitors.extend(monitors);
        // a monitor may already have torn the pipeline down
        state.monitors_active = state.converter.child.is_some();
        Ok(())
    }

    fn launch(
        &self,
        kind: ProcessKind,
        command: &CommandSpec,
        stdin: Option<ChildOutput>,
        pipe_stdout: bool,
    ) -> Result<Box<dyn ChildProcess>, PipelineError> {
        self.lock_state().process_mut(kind).state = ProcessState::Starting;
        info!("Launching {}: {}", kind, command);

        self.host
            .spawn(command, stdin, pipe_stdout)
            .map_err(|source| {
                self.lock_state().process_mut(kind).state = ProcessState::Stopped;
                PipelineError::Launch {
                    kind,
                    program: command.program.clone(),
                    source,
                }
            })
    }

    fn adopt(&self, kind: ProcessKind, child: Box<dyn ChildProcess>) {
        debug!("{} running as pid {}", kind, child.id());
        let mut state = self.lock_state();
        let process = state.process_mut(kind);
        process.child = Some(child);
        process.state = ProcessState::Running;
    }

    /// Best-effort teardown. Every step runs even if an earlier one failed;
    /// process handles are taken under the lock so concurrent callers never
    /// release the same child twice.
    pub fn cleanup(&self) {
        let children: Vec<_> = {
            let mut state = self.lock_state();
            state.monitors_active = false;
            [ProcessKind::Source, ProcessKind::Converter]
                .into_iter()
                .filter_map(|kind| {
                    let process = state.process_mut(kind);
                    let child = process.child.take()?;
                    process.state = ProcessState::Terminating;
                    Some((process.kind, child))
                })
                .collect()
        };

        for (kind, mut child) in children {
            match child.terminate(self.config.terminate_grace()) {
                Ok(()) => info!("{} process terminated", kind),
                Err(source) => error!("{}", PipelineError::Terminate { kind, source }),
            }
            self.lock_state().process_mut(kind).state = ProcessState::Terminated;
        }

        match self.kill_source_by_name() {
            Ok(()) => info!("{} cleaned up", self.source_name()),
            Err(e) => error!("Error running pkill: {}", e),
        }

        match self.unload_module() {
            Ok(()) => info!("{} cleaned up", self.config.module),
            Err(e) => error!("Error cleaning up camera: {}", e),
        }
    }

    /// Cleanup, then wait up to `timeout` for the monitor threads to exit.
    /// Must not be called from a monitor thread.
    pub fn shutdown(&self, timeout: Duration) {
        self.cleanup();

        let monitors = std::mem::take(&mut self.lock_state().monitors);
        let deadline = Instant::now() + timeout;
        for handle in monitors {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if !handle.is_finished() {
                warn!("Monitor thread still blocked after {:?}, detaching", timeout);
                continue;
            }
            match handle.join() {
                Ok(exit) => debug!("Monitor exited: {:?}", exit),
                Err(_) => error!("Monitor thread panicked"),
            }
        }
    }

    pub fn status(&self) -> PipelineStatus {
        let state = self.lock_state();
        PipelineStatus {
            source: state.source.state,
            converter: state.converter.state,
            monitors_active: state.monitors_active,
        }
    }

    fn source_name(&self) -> String {
        Path::new(&self.config.gphoto2)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.gphoto2.to_string_lossy().into_owned())
    }

    fn kill_source_by_name(&self) -> Result<(), PipelineError> {
        let name = self.source_name();
        let command = CommandSpec::new("pkill", ["-9", name.as_str()]).privileged(self.config.use_sudo);
        let status = self
            .host
            .run(&command)
            .map_err(|source| PipelineError::KillByName {
                name: name.clone(),
                source,
            })?;
        // pkill exits 1 when nothing matched
        match status.code() {
            Some(0) | Some(1) => Ok(()),
            _ => Err(PipelineError::Failed {
                command: command.to_string(),
                status,
            }),
        }
    }

    fn unload_module(&self) -> Result<(), PipelineError> {
        let command = CommandSpec::new("rmmod", [self.config.module.as_str()]).privileged(self.config.use_sudo);
        self.run_module_command(command)
    }

    fn load_module(&self) -> Result<(), PipelineError> {
        let mut args = vec![self.config.module.clone()];
        args.extend(self.config.module_params.iter().cloned());
        let command = CommandSpec::new("modprobe", args).privileged(self.config.use_sudo);
        self.run_module_command(command)
    }

    fn run_module_command(&self, command: CommandSpec) -> Result<(), PipelineError> {
        let status = self.host.run(&command).map_err(|source| PipelineError::Command {
            command: command.to_string(),
            source,
        })?;
        if !status.success() {
            return Err(PipelineError::Failed {
                command: command.to_string(),
                status,
            });
        }
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Teardown for ProcessSupervisor {
    fn cleanup(&self) {
        ProcessSupervisor::cleanup(self)
    }
}
