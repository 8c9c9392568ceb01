pub mod definitions;
pub mod error;
pub mod job;
pub mod log_event;
pub mod task;

pub use definitions::{Frontend, SearchBackend, SearchBackendKind, UserScript};
pub use error::{CoreError, CoreErrorKind};
pub use job::{ArchiveMode, IndexOptions, Job, JobStatus, ScanOptions};
pub use log_event::{DIAGNOSTIC_KEY, LogEvent, LogStream};
pub use task::{TaskId, TaskKind, TaskProgress, TaskRecord, TaskStatus};
