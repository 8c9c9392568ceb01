#![cfg(unix)]

use std::time::Duration;

use conductor_core::execution::{
    CommandSpec, LogEventReceiver, ProcessExitStatus, ProcessSpawnRequest,
    ProcessTerminationMode, StdoutFormat, TokioProcessExecutor, signal_process, spawn_validated,
};
use conductor_core::models::{CoreErrorKind, LogEvent, LogStream, TaskId};

fn shell(script: &str) -> ProcessSpawnRequest {
    ProcessSpawnRequest::new(CommandSpec::new("/bin/sh").arg("-c").arg(script))
}

async fn collect(events: Option<LogEventReceiver>) -> Vec<LogEvent> {
    let mut events = events.expect("log stream should be available once");
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }
    collected
}

#[tokio::test]
async fn text_output_is_streamed_in_order() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, shell("echo one; echo two; echo three"))
        .expect("spawn should succeed");

    assert!(handle.pid().is_some());
    let events = handle.take_log_events();
    assert!(handle.take_log_events().is_none());

    let (events, output) = tokio::join!(collect(events), handle.wait());
    let output = output.expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::ExitCode(0));
    assert!(output.started_at <= output.finished_at);
    let lines: Vec<String> = events
        .into_iter()
        .map(|event| match event {
            LogEvent::Line {
                stream: LogStream::Stdout,
                text,
            } => text,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(lines, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn json_mode_separates_records_progress_and_diagnostics() {
    let executor = TokioProcessExecutor;
    let script = r#"
echo '{"message": "scanning"}'
echo '$PROGRESS {"done": 1, "total": 2}'
echo 'not json'
echo 'warning' >&2
exit 3
"#;
    let handle = spawn_validated(&executor, shell(script).stdout_format(StdoutFormat::Json))
        .expect("spawn should succeed");
    let events = handle.take_log_events();
    let (events, output) = tokio::join!(collect(events), handle.wait());

    assert_eq!(output.unwrap().status.code(), 3);
    assert!(events.iter().any(
        |event| matches!(event, LogEvent::Record(record) if record["message"] == "scanning")
    ));
    assert!(events.iter().any(
        |event| matches!(event, LogEvent::Progress(progress) if progress.done == 1 && progress.total == 2)
    ));
    assert!(events.iter().any(
        |event| matches!(event, LogEvent::Diagnostic(message) if message.contains("not json"))
    ));
    assert!(events.iter().any(|event| matches!(
        event,
        LogEvent::Line { stream: LogStream::Stderr, text } if text == "warning"
    )));
}

#[tokio::test]
async fn missing_program_fails_to_spawn() {
    let executor = TokioProcessExecutor;
    let task_id = TaskId::new();
    let request = ProcessSpawnRequest::new(CommandSpec::new("/nonexistent/indexer")).task_id(task_id);

    let error = spawn_validated(&executor, request)
        .err()
        .expect("spawn should fail");
    assert_eq!(error.kind, CoreErrorKind::ProcessFailure);
    assert_eq!(error.task, Some(task_id));
}

#[tokio::test]
async fn signalled_group_reports_negative_signal() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, shell("exec sleep 30")).expect("spawn should succeed");

    let pid = handle.pid().expect("spawned process should have a pid");
    signal_process(pid, ProcessTerminationMode::Graceful).expect("signal should succeed");

    let output = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("process should exit after SIGTERM")
        .expect("wait should succeed");
    assert_eq!(
        output.status,
        ProcessExitStatus::Terminated {
            signal: Some(libc::SIGTERM)
        }
    );
    assert_eq!(output.status.code(), -libc::SIGTERM);
}

#[test]
fn signalling_an_exited_group_is_not_an_error() {
    let mut child = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg("exit 0")
        .spawn()
        .expect("spawn should succeed");
    let pid = child.id();
    child.wait().expect("wait should succeed");

    assert!(signal_process(pid, ProcessTerminationMode::Graceful).is_ok());
}
