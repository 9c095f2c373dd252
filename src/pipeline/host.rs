//! OS process operations used by the supervisor

use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

const REAP_POLL: Duration = Duration::from_millis(50);

/// Program plus argument list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Prefix with `sudo` when `privileged` is set.
    pub fn privileged(self, privileged: bool) -> Self {
        if !privileged {
            return self;
        }
        let mut args = vec![self.program.to_string_lossy().into_owned()];
        args.extend(self.args);
        Self {
            program: PathBuf::from("sudo"),
            args,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Standard output of a launched process, handed on as another process's stdin.
pub enum ChildOutput {
    Pipe(ChildStdout),
    /// In-process stream standing in for a real pipe, used by hosts that fake
    /// their children (see `tests/pipeline.rs`). [`SystemHost`] pumps it into
    /// the next process's stdin on a helper thread.
    Reader(Box<dyn Read + Send>),
}

impl Read for ChildOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ChildOutput::Pipe(out) => out.read(buf),
            ChildOutput::Reader(out) => out.read(buf),
        }
    }
}

impl fmt::Debug for ChildOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildOutput::Pipe(_) => f.write_str("ChildOutput::Pipe"),
            ChildOutput::Reader(_) => f.write_str("ChildOutput::Reader"),
        }
    }
}

/// A running child process.
pub trait ChildProcess: Send {
    fn id(&self) -> u32;

    fn take_stdout(&mut self) -> Option<ChildOutput>;

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Ask the process to exit, escalate to a kill after `grace`, and reap it.
    /// A process that already exited is not an error.
    fn terminate(&mut self, grace: Duration) -> io::Result<()>;
}

/// Process launching and command execution.
pub trait ProcessHost: Send + Sync {
    /// Launch `command` with stderr piped. Stdout is piped when `pipe_stdout`
    /// is set and discarded otherwise; stdin is `stdin` or null.
    fn spawn(
        &self,
        command: &CommandSpec,
        stdin: Option<ChildOutput>,
        pipe_stdout: bool,
    ) -> io::Result<Box<dyn ChildProcess>>;

    /// Run `command` to completion.
    fn run(&self, command: &CommandSpec) -> io::Result<ExitStatus>;
}

/// [`ProcessHost`] backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl ProcessHost for SystemHost {
    fn spawn(
        &self,
        command: &CommandSpec,
        stdin: Option<ChildOutput>,
        pipe_stdout: bool,
    ) -> io::Result<Box<dyn ChildProcess>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdout(if pipe_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped());

        let mut pump = None;
        match stdin {
            None => {
                cmd.stdin(Stdio::null());
            }
            Some(ChildOutput::Pipe(out)) => {
                cmd.stdin(Stdio::from(out));
            }
            Some(ChildOutput::Reader(reader)) => {
                cmd.stdin(Stdio::piped());
                pump = Some(reader);
            }
        }

        let mut child = cmd.spawn()?;
        debug!("Spawned `{}` as pid {}", command, child.id());

        if let (Some(mut reader), Some(mut sink)) = (pump, child.stdin.take()) {
            thread::Builder::new()
                .name("stdin-pump".into())
                .spawn(move || {
                    if let Err(e) = io::copy(&mut reader, &mut sink) {
                        debug!("stdin pump ended: {}", e);
                    }
                })?;
        }

        Ok(Box::new(SystemChild { child }))
    }

    fn run(&self, command: &CommandSpec) -> io::Result<ExitStatus> {
        debug!("Running `{}`", command);
        Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
    }
}

struct SystemChild {
    child: Child,
}

impl ChildProcess for SystemChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<ChildOutput> {
        self.child.stdout.take().map(ChildOutput::Pipe)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stderr
            .take()
            .map(|err| Box::new(err) as Box<dyn Read + Send>)
    }

    fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        let pid = Pid::from_raw(self.child.id() as i32);
        match signal::kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => return Err(errno.into()),
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(REAP_POLL);
        }

        warn!("pid {} ignored SIGTERM for {:?}, killing", pid, grace);
        match self.child.kill() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait().map(|_| ())
    }
}
