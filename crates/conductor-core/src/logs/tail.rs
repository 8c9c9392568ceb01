use std::collections::VecDeque;
use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::models::{CoreError, CoreErrorKind};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TailEvent {
    Line(String),
    /// Nothing new has been appended since the last call.
    NoData,
}

/// Follows an append-only file. The first lines handed out are the last `n`
/// lines present when the tail was opened; after that every newly completed
/// line is returned exactly once.
pub struct LogTail {
    file: tokio::fs::File,
    ready: VecDeque<String>,
    partial: Vec<u8>,
    limit: usize,
    primed: bool,
}

impl LogTail {
    pub async fn open(path: impl AsRef<Path>, n: usize) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|error| {
            let kind = if error.kind() == std::io::ErrorKind::NotFound {
                CoreErrorKind::NotFound
            } else {
                CoreErrorKind::Internal
            };
            CoreError::new(
                kind,
                format!("failed to open log '{}': {error}", path.display()),
            )
        })?;

        Ok(Self {
            file,
            ready: VecDeque::new(),
            partial: Vec::new(),
            limit: n,
            primed: false,
        })
    }

    pub async fn next_event(&mut self) -> Result<TailEvent, CoreError> {
        if !self.primed {
            self.read_available(Some(self.limit)).await?;
            self.primed = true;
        } else if self.ready.is_empty() {
            self.read_available(None).await?;
        }

        Ok(match self.ready.pop_front() {
            Some(line) => TailEvent::Line(line),
            None => TailEvent::NoData,
        })
    }

    /// Reads up to end-of-file. With `keep`, only the newest `keep` complete
    /// lines stay buffered.
    async fn read_available(&mut self, keep: Option<usize>) -> Result<(), CoreError> {
        let mut chunk = vec![0_u8; READ_CHUNK];
        loop {
            let read = self.file.read(&mut chunk).await.map_err(|error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("failed to read log: {error}"),
                )
            })?;
            if read == 0 {
                return Ok(());
            }

            for byte in &chunk[..read] {
                if *byte != b'\n' {
                    self.partial.push(*byte);
                    continue;
                }

                let line = String::from_utf8_lossy(&self.partial)
                    .trim_end_matches('\r')
                    .to_string();
                self.partial.clear();
                self.ready.push_back(line);
                if let Some(keep) = keep
                    && self.ready.len() > keep
                {
                    self.ready.pop_front();
                }
            }
        }
    }
}
