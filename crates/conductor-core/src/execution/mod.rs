pub mod line_parser;
pub mod tokio_process;

pub use line_parser::{PROGRESS_MARKER, StdoutFormat, parse_stderr_line, parse_stdout_line};
pub use tokio_process::TokioProcessExecutor;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::models::{CoreError, CoreErrorKind, LogEvent, TaskId};

pub type ExecutionResult<T> = Result<T, CoreError>;

pub type ProcessWaitFuture = Pin<Box<dyn Future<Output = ExecutionResult<ProcessOutput>> + Send>>;

pub type LogEventReceiver = mpsc::UnboundedReceiver<LogEvent>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input("command program path must not be empty"));
        }

        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(invalid_input("command args must not contain NUL bytes"));
        }

        Ok(())
    }

    pub fn describe(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpawnRequest {
    pub task_id: Option<TaskId>,
    pub command: CommandSpec,
    pub stdout_format: StdoutFormat,
}

impl ProcessSpawnRequest {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            task_id: None,
            command,
            stdout_format: StdoutFormat::Text,
        }
    }

    pub fn task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn stdout_format(mut self, stdout_format: StdoutFormat) -> Self {
        self.stdout_format = stdout_format;
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        self.command.validate().map_err(|error| self.attribute(error))
    }

    fn attribute(&self, error: CoreError) -> CoreError {
        match self.task_id {
            Some(task_id) if error.task.is_none() => error.for_task(task_id),
            _ => error,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessTerminationMode {
    Graceful,
    Immediate,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExitStatus {
    ExitCode(i32),
    Terminated { signal: Option<i32> },
}

impl ProcessExitStatus {
    /// Numeric return code as recorded in task records. Signal terminations
    /// are reported as the negated signal number.
    pub fn code(self) -> i32 {
        match self {
            ProcessExitStatus::ExitCode(code) => code,
            ProcessExitStatus::Terminated {
                signal: Some(signal),
            } => -signal,
            ProcessExitStatus::Terminated { signal: None } => -1,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessOutput {
    pub status: ProcessExitStatus,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

pub trait RunningProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Hands out the structured log stream. Only the first call returns it.
    fn take_log_events(&self) -> Option<LogEventReceiver>;

    fn wait(self: Box<Self>) -> ProcessWaitFuture;
}

pub trait ProcessExecutor: Send + Sync {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>>;
}

pub fn spawn_validated(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
) -> ExecutionResult<Box<dyn RunningProcess>> {
    request.validate()?;
    executor.spawn(request)
}

/// Sends a termination signal to the process group led by `pid`.
/// A process that already exited is not an error.
#[cfg(unix)]
pub fn signal_process(pid: u32, mode: ProcessTerminationMode) -> ExecutionResult<()> {
    let signal = match mode {
        ProcessTerminationMode::Immediate => libc::SIGKILL,
        ProcessTerminationMode::Graceful => libc::SIGTERM,
    };

    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };

    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(CoreError::new(
                CoreErrorKind::ProcessFailure,
                format!("failed to send signal {signal} to process group {pid}: {os_error}"),
            ));
        }
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn signal_process(pid: u32, _mode: ProcessTerminationMode) -> ExecutionResult<()> {
    Err(CoreError::new(
        CoreErrorKind::ProcessFailure,
        format!("signalling process {pid} is only supported on unix"),
    ))
}

fn invalid_input(message: &str) -> CoreError {
    CoreError::new(CoreErrorKind::InvalidInput, message)
}
