use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::execution::{
    ExecutionResult, LogEventReceiver, ProcessExecutor, ProcessExitStatus, ProcessOutput,
    ProcessSpawnRequest, ProcessWaitFuture, RunningProcess, parse_stderr_line, parse_stdout_line,
};
use crate::models::{CoreError, CoreErrorKind, LogEvent, TaskId};

const READER_DRAIN_DEADLINE: Duration = Duration::from_millis(250);

pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|error| {
            process_failure(
                request.task_id,
                format!(
                    "failed to spawn '{}': {error}",
                    request.command.program.display()
                ),
            )
        })?;

        let pid = child.id();
        let started_at = SystemTime::now();

        let (sender, receiver) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let format = request.stdout_format;
            readers.push(spawn_line_reader(stdout, sender.clone(), move |line| {
                parse_stdout_line(line, format)
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, sender, parse_stderr_line));
        }

        Ok(Box::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            events: Mutex::new(Some(receiver)),
            readers,
            pid,
            started_at,
            task_id: request.task_id,
        }))
    }
}

fn spawn_line_reader<R, F>(
    stream: R,
    sender: mpsc::UnboundedSender<LogEvent>,
    parse: F,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(&str) -> Option<LogEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer);
                    if let Some(event) = parse(&line) {
                        // The consumer may have gone away; keep draining the pipe regardless.
                        let _ = sender.send(event);
                    }
                }
                Err(error) => {
                    let _ = sender.send(LogEvent::diagnostic(format!(
                        "failed to read process output: {error}"
                    )));
                    break;
                }
            }
        }
    })
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    events: Mutex<Option<LogEventReceiver>>,
    readers: Vec<JoinHandle<()>>,
    pid: Option<u32>,
    started_at: SystemTime,
    task_id: Option<TaskId>,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_log_events(&self) -> Option<LogEventReceiver> {
        self.events.lock().ok().and_then(|mut guard| guard.take())
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let TokioRunningProcess {
            child,
            readers,
            started_at,
            task_id,
            ..
        } = *self;
        let child = child.into_inner().ok().flatten();

        Box::pin(async move {
            let mut child = child.ok_or_else(|| {
                process_failure(task_id, "child process already consumed".to_string())
            })?;

            // Descendants may inherit the pipes, so exit is awaited before the readers.
            let status = child.wait().await.map_err(|error| {
                process_failure(task_id, format!("failed to wait for process: {error}"))
            })?;

            for reader in readers {
                let abort = reader.abort_handle();
                if tokio::time::timeout(READER_DRAIN_DEADLINE, reader)
                    .await
                    .is_err()
                {
                    abort.abort();
                }
            }

            let finished_at = SystemTime::now();

            Ok(ProcessOutput {
                status: exit_status(status),
                started_at,
                finished_at,
            })
        })
    }
}

#[cfg(unix)]
fn exit_status(status: std::process::ExitStatus) -> ProcessExitStatus {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => ProcessExitStatus::ExitCode(code),
        None => ProcessExitStatus::Terminated {
            signal: status.signal(),
        },
    }
}

#[cfg(not(unix))]
fn exit_status(status: std::process::ExitStatus) -> ProcessExitStatus {
    match status.code() {
        Some(code) => ProcessExitStatus::ExitCode(code),
        None => ProcessExitStatus::Terminated { signal: None },
    }
}

fn process_failure(task_id: Option<TaskId>, message: String) -> CoreError {
    let error = CoreError::new(CoreErrorKind::ProcessFailure, message);
    match task_id {
        Some(task_id) => error.for_task(task_id),
        None => error,
    }
}

