//! Runs external tools to completion and captures everything they print.

use std::{
    fmt,
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, trace, warn};
use thiserror::Error;

use crate::{error::Stage, utils::term};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Public Interface
// =============================================================================

/// A fully specified external tool invocation.
///
/// Arguments added with [`ToolCommand::secret_arg`] are passed to the process
/// as is but masked whenever the command is displayed or logged.
#[derive(Clone, Eq, PartialEq)]
pub struct ToolCommand {
    stage: Stage,
    program: PathBuf,
    args: Vec<String>,
    secret_args: Vec<usize>,
    cwd: Option<PathBuf>,
}
impl ToolCommand {
    pub fn new(stage: Stage, program: impl Into<PathBuf>) -> Self {
        ToolCommand {
            stage,
            program: program.into(),
            args: Vec::new(),
            secret_args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// The pipeline stage this invocation belongs to.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}
impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for (index, arg) in self.args.iter().enumerate() {
            if self.secret_args.contains(&index) {
                f.write_str(" ********")?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}
impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCommand")
            .field("stage", &self.stage)
            .field("command", &self.to_string())
            .field("cwd", &self.cwd)
            .finish()
    }
}

/// What a tool left behind once it exited. Output is decoded lossily.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InvocationResult {
    /// `None` when the process was terminated by a signal.
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}
impl InvocationResult {
    pub fn new(exit_status: Option<i32>, stdout: &str, stderr: &str) -> Self {
        InvocationResult {
            exit_status,
            stdout: stdout.to_owned(),
            stderr: stderr.to_owned(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    /// The process could not be started at all.
    #[error("could not launch `{program}`: {source}")]
    Launch {
        stage: Stage,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout {
        stage: Stage,
        command: String,
        timeout: Duration,
    },

    #[error("`{command}` was interrupted")]
    Interrupted { stage: Stage, command: String },

    #[error("lost track of `{command}`: {source}")]
    Io {
        stage: Stage,
        command: String,
        #[source]
        source: io::Error,
    },
}
impl InvokeError {
    pub fn stage(&self) -> Stage {
        match self {
            InvokeError::Launch { stage, .. }
            | InvokeError::Timeout { stage, .. }
            | InvokeError::Interrupted { stage, .. }
            | InvokeError::Io { stage, .. } => *stage,
        }
    }
}

/// The seam between pipeline stages and the processes they drive.
pub trait ToolRunner {
    /// Run the command to completion. Output content is never interpreted.
    fn invoke(&self, command: &ToolCommand) -> Result<InvocationResult, InvokeError>;
}
impl<T: ToolRunner + ?Sized> ToolRunner for &T {
    fn invoke(&self, command: &ToolCommand) -> Result<InvocationResult, InvokeError> {
        (**self).invoke(command)
    }
}

/// Runs tools as child processes with a bounded run time.
///
/// The `interrupted` flag is shared with the Ctrl+C handler. When it is
/// raised, the running child is killed, which also releases the serial device
/// it may hold.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    timeout: Duration,
    interrupted: Arc<AtomicBool>,
    echo: bool,
}
impl ProcessInvoker {
    pub fn new(timeout: Duration, interrupted: Arc<AtomicBool>) -> Self {
        ProcessInvoker {
            timeout,
            interrupted,
            echo: false,
        }
    }

    /// Print the captured streams of every invocation to the terminal.
    pub fn echo_output(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}
impl ToolRunner for ProcessInvoker {
    fn invoke(&self, command: &ToolCommand) -> Result<InvocationResult, InvokeError> {
        debug!("running `{}`", command);

        let mut process = Command::new(command.program());
        process
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = command.cwd() {
            process.current_dir(dir);
        }

        let mut child = process.spawn().map_err(|source| InvokeError::Launch {
            stage: command.stage(),
            program: command.program().display().to_string(),
            source,
        })?;

        // Both pipes are drained concurrently, otherwise a tool filling up one
        // of them while we wait on the other would never exit.
        let started = Instant::now();
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(120);
        pb.set_style(
            ProgressStyle::default_spinner()
                .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
                .template("[MP] {spinner:.blue} {msg}"),
        );
        pb.set_message(format!("{}...", command));

        // The pipes can outlive the child when it leaves a background process
        // behind, so collecting them counts against the same time budget.
        let finished = self.wait(&mut child, command, started).and_then(|status| {
            let stdout = self.collect(&stdout, command, started)?;
            let stderr = self.collect(&stderr, command, started)?;
            Ok((status, stdout, stderr))
        });
        pb.finish_and_clear();
        let (status, stdout, stderr) = finished?;

        let result = InvocationResult {
            exit_status: status.code(),
            stdout,
            stderr,
        };
        debug!("`{}` exited with {:?}", command, result.exit_status);
        trace!("stdout:\n{}", result.stdout);
        trace!("stderr:\n{}", result.stderr);

        if self.echo {
            term::tool_output(&result.stdout, &result.stderr);
        }

        Ok(result)
    }
}

// =============================================================================
// Private stuff
// =============================================================================

impl ProcessInvoker {
    fn wait(
        &self,
        child: &mut Child,
        command: &ToolCommand,
        started: Instant,
    ) -> Result<ExitStatus, InvokeError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    terminate(child);
                    return Err(InvokeError::Io {
                        stage: command.stage(),
                        command: command.to_string(),
                        source,
                    });
                }
            }

            if let Err(err) = self.within_budget(command, started) {
                terminate(child);
                return Err(err);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait for a drained pipe. Gives up on interrupt or when the invocation
    /// runs out of time; the reader thread is then left to finish on its own.
    fn collect(
        &self,
        pipe: &Receiver<Vec<u8>>,
        command: &ToolCommand,
        started: Instant,
    ) -> Result<String, InvokeError> {
        loop {
            match pipe.recv_timeout(POLL_INTERVAL) {
                Ok(bytes) => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
                Err(RecvTimeoutError::Disconnected) => return Ok(String::new()),
                Err(RecvTimeoutError::Timeout) => {}
            }
            if let Err(err) = self.within_budget(command, started) {
                warn!("output of `{}` still open, giving up on it", command);
                return Err(err);
            }
        }
    }

    fn within_budget(&self, command: &ToolCommand, started: Instant) -> Result<(), InvokeError> {
        if self.interrupted.load(Ordering::SeqCst) {
            warn!("interrupt received, stopping `{}`", command);
            return Err(InvokeError::Interrupted {
                stage: command.stage(),
                command: command.to_string(),
            });
        }
        if started.elapsed() > self.timeout {
            warn!("`{}` timed out after {:?}", command, self.timeout);
            return Err(InvokeError::Timeout {
                stage: command.stage(),
                command: command.to_string(),
                timeout: self.timeout,
            });
        }
        Ok(())
    }
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("kill: {}", e);
    }
    if let Err(e) = child.wait() {
        debug!("reap: {}", e);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut reader) = pipe {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            if let Err(e) = reader.read_to_end(&mut buffer) {
                debug!("error while reading tool output: {}", e);
            }
            // The receiver is gone when the invocation already gave up.
            tx.send(buffer).ok();
        });
    }
    rx
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
fn invoker(timeout: Duration) -> ProcessInvoker {
    ProcessInvoker::new(timeout, Arc::new(AtomicBool::new(false)))
}

#[test]
fn secret_arguments_are_masked() {
    let command = ToolCommand::new(Stage::Wifi, "mos")
        .arg("wifi")
        .arg("workshop")
        .secret_arg("hunter2")
        .arg("--port")
        .arg("/dev/ttyUSB0");
    let shown = command.to_string();
    assert_eq!(shown, "mos wifi workshop ******** --port /dev/ttyUSB0");
    assert!(!format!("{:?}", command).contains("hunter2"));
    assert_eq!(command.args()[2], "hunter2");
}

#[test]
fn missing_executable_is_a_launch_error() {
    let command = ToolCommand::new(Stage::Build, "/nonexistent/mos-tool").arg("build");
    match invoker(Duration::from_secs(5)).invoke(&command) {
        Err(InvokeError::Launch { program, .. }) => assert_eq!(program, "/nonexistent/mos-tool"),
        other => panic!("expected a launch error, got {:?}", other),
    }
}

#[cfg(unix)]
#[test]
fn captures_both_streams() {
    let command = ToolCommand::new(Stage::Flash, "sh")
        .arg("-c")
        .arg("echo out; echo 'All done!' >&2; exit 3");
    let result = invoker(Duration::from_secs(10)).invoke(&command).unwrap();
    assert_eq!(result.exit_status, Some(3));
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "All done!\n");
    assert!(!result.succeeded());
}

#[cfg(unix)]
#[test]
fn runs_in_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let command = ToolCommand::new(Stage::Build, "pwd").current_dir(dir.path());
    let result = invoker(Duration::from_secs(10)).invoke(&command).unwrap();
    let printed = std::fs::canonicalize(result.stdout.trim()).unwrap();
    assert_eq!(printed, std::fs::canonicalize(dir.path()).unwrap());
}

#[cfg(unix)]
#[test]
fn hung_tool_times_out() {
    let command = ToolCommand::new(Stage::Flash, "sleep").arg("5");
    let started = Instant::now();
    match invoker(Duration::from_millis(200)).invoke(&command) {
        Err(InvokeError::Timeout { stage, .. }) => assert_eq!(stage, Stage::Flash),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[cfg(unix)]
#[test]
fn interrupt_stops_the_tool() {
    let flag = Arc::new(AtomicBool::new(true));
    let command = ToolCommand::new(Stage::Provision, "sleep").arg("5");
    match ProcessInvoker::new(Duration::from_secs(30), flag).invoke(&command) {
        Err(InvokeError::Interrupted { .. }) => {}
        other => panic!("expected an interrupt, got {:?}", other),
    }
}

#[cfg(unix)]
#[test]
fn background_child_holding_the_pipes_times_out() {
    let command = ToolCommand::new(Stage::Build, "sh")
        .arg("-c")
        .arg("sleep 5 & echo started");
    let started = Instant::now();
    match invoker(Duration::from_millis(300)).invoke(&command) {
        Err(InvokeError::Timeout { stage, .. }) => assert_eq!(stage, Stage::Build),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
}
