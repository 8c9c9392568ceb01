use serde_json::{Map, Value, json};

use crate::models::TaskProgress;

pub const DIAGNOSTIC_KEY: &str = "conductor";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogEvent {
    Line { stream: LogStream, text: String },
    Record(Map<String, Value>),
    Progress(TaskProgress),
    Diagnostic(String),
}

impl LogEvent {
    pub fn diagnostic(message: impl Into<String>) -> Self {
        LogEvent::Diagnostic(message.into())
    }

    /// JSON form written to task log files. Progress updates have none.
    pub fn to_log_value(&self) -> Option<Value> {
        match self {
            LogEvent::Line { stream, text } => Some(json!({ stream.as_str(): text })),
            LogEvent::Record(record) => Some(Value::Object(record.clone())),
            LogEvent::Progress(_) => None,
            LogEvent::Diagnostic(message) => Some(json!({ DIAGNOSTIC_KEY: message })),
        }
    }
}
