pub mod chain;
pub mod job_tasks;
pub mod launcher;
pub mod queue;
pub mod task;

pub use chain::{build_chain, script_task};
pub use job_tasks::JobTaskExecutor;
pub use launcher::{JobLauncher, RunSubmitter, SubmitFuture};
pub use queue::{QueueSettings, SkippedTask, TaskExecutor, TaskFuture, TaskQueue};
pub use task::{LiveTask, Task, TaskSnapshot};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
