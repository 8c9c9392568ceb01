use std::sync::Arc;

use crate::models::{
    CoreError, CoreErrorKind, Frontend, Job, SearchBackend, TaskId, TaskRecord, UserScript,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait JobStore: Send + Sync {
    fn job(&self, name: &str) -> PersistenceResult<Option<Job>>;

    fn list_jobs(&self) -> PersistenceResult<Vec<Job>>;

    fn save_job(&self, job: &Job) -> PersistenceResult<()>;

    fn delete_job(&self, name: &str) -> PersistenceResult<bool>;
}

pub trait TaskRecordStore: Send + Sync {
    fn insert_task_record(&self, record: &TaskRecord) -> PersistenceResult<()>;

    fn task_record(&self, id: TaskId) -> PersistenceResult<Option<TaskRecord>>;

    /// Most recent first. Records that started in the same instant keep
    /// insertion order, newest first.
    fn list_task_records(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>>;

    /// Records of `job` that still own a log file, minus the newest `keep`.
    fn log_records_to_remove(&self, job: &str, keep: usize) -> PersistenceResult<Vec<TaskId>>;

    fn clear_has_logs(&self, id: TaskId) -> PersistenceResult<()>;
}

pub trait DefinitionStore: Send + Sync {
    fn user_script(&self, name: &str) -> PersistenceResult<Option<UserScript>>;

    fn save_user_script(&self, script: &UserScript) -> PersistenceResult<()>;

    fn search_backend(&self, name: &str) -> PersistenceResult<Option<SearchBackend>>;

    fn save_search_backend(&self, backend: &SearchBackend) -> PersistenceResult<()>;

    fn frontend(&self, name: &str) -> PersistenceResult<Option<Frontend>>;

    fn list_frontends(&self) -> PersistenceResult<Vec<Frontend>>;

    fn save_frontend(&self, frontend: &Frontend) -> PersistenceResult<()>;
}

pub trait StateStore: JobStore + TaskRecordStore + DefinitionStore {}

impl<T> StateStore for T where T: JobStore + TaskRecordStore + DefinitionStore {}

/// Runs a synchronous store call on the blocking pool.
pub async fn run_blocking<S, T, F>(store: &Arc<S>, operation: F) -> PersistenceResult<T>
where
    S: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> PersistenceResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || operation(store.as_ref()))
        .await
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("store call did not complete: {error}"),
            )
        })?
}
