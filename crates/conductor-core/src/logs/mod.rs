pub mod tail;

pub use tail::{LogTail, TailEvent};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::models::{LogEvent, TaskId};

/// Layout of per-task and per-frontend log files under one directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskLogs {
    log_dir: PathBuf,
}

impl TaskLogs {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn path_for(&self, id: TaskId) -> PathBuf {
        self.log_dir.join(format!("task-{id}.log"))
    }

    pub fn frontend_path(&self, name: &str) -> PathBuf {
        self.log_dir
            .join(format!("frontend-{}.log", name.replace('/', "_")))
    }

    pub fn exists(&self, id: TaskId) -> bool {
        self.path_for(id).is_file()
    }

    /// Removes the log file of `id`. A file that is already gone counts as deleted.
    pub fn delete(&self, id: TaskId) -> std::io::Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error),
        }
    }
}

/// Appends JSON lines to a log file. Write failures are logged and dropped so a
/// full disk never takes a running task down with it.
pub struct TaskLogSink {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl TaskLogSink {
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent()
            && let Err(error) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(path = %parent.display(), error = %error, "failed to create log directory");
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
        {
            Ok(file) => Some(file),
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to open log file");
                None
            }
        };

        Self { path, file }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write_event(&mut self, event: &LogEvent) {
        let Some(value) = event.to_log_value() else {
            return;
        };
        let Some(file) = self.file.as_mut() else {
            return;
        };

        let mut line = value.to_string();
        line.push('\n');
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(error) = result {
            tracing::warn!(path = %self.path.display(), error = %error, "failed to write log line");
        }
    }

    pub async fn diagnostic(&mut self, message: impl Into<String>) {
        self.write_event(&LogEvent::diagnostic(message)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::TaskLogs;
    use crate::models::TaskId;
    use std::path::PathBuf;

    #[test]
    fn task_log_path_embeds_task_id() {
        let logs = TaskLogs::new("/var/conductor/logs");
        let id = TaskId::new();
        assert_eq!(
            logs.path_for(id),
            PathBuf::from(format!("/var/conductor/logs/task-{id}.log"))
        );
    }

    #[test]
    fn frontend_names_are_flattened() {
        let logs = TaskLogs::new("/logs");
        assert_eq!(
            logs.frontend_path("team/docs"),
            PathBuf::from("/logs/frontend-team_docs.log")
        );
    }

    #[test]
    fn deleting_missing_log_is_not_an_error() {
        let logs = TaskLogs::new(std::env::temp_dir().join("conductor-missing-logs"));
        assert!(logs.delete(TaskId::new()).is_ok());
    }
}
