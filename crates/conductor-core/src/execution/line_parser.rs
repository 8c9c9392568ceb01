use serde_json::Value;

use crate::models::{LogEvent, LogStream, TaskProgress};

pub const PROGRESS_MARKER: &str = "$PROGRESS";

/// How a child's stdout lines are interpreted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum StdoutFormat {
    /// One JSON object per line; anything else becomes a diagnostic record.
    Json,
    /// Free text forwarded verbatim.
    #[default]
    Text,
}

pub fn parse_stdout_line(line: &str, format: StdoutFormat) -> Option<LogEvent> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return None;
    }

    if let Some(payload) = trimmed.strip_prefix(PROGRESS_MARKER) {
        return Some(match serde_json::from_str::<TaskProgress>(payload.trim()) {
            Ok(progress) => LogEvent::Progress(progress),
            Err(error) => {
                LogEvent::diagnostic(format!("Could not decode progress line: {trimmed}; {error}"))
            }
        });
    }

    match format {
        StdoutFormat::Text => Some(LogEvent::Line {
            stream: LogStream::Stdout,
            text: trimmed.to_string(),
        }),
        StdoutFormat::Json => Some(match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(record)) => LogEvent::Record(record),
            Ok(_) => LogEvent::diagnostic(format!(
                "Could not decode log line: {trimmed}; expected a JSON object"
            )),
            Err(error) => {
                LogEvent::diagnostic(format!("Could not decode log line: {trimmed}; {error}"))
            }
        }),
    }
}

pub fn parse_stderr_line(line: &str) -> Option<LogEvent> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return None;
    }
    Some(LogEvent::Line {
        stream: LogStream::Stderr,
        text: trimmed.to_string(),
    })
}
