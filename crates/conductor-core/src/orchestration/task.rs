use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::Serialize;

use crate::models::{TaskId, TaskKind, TaskProgress, TaskStatus};

/// Shared handle to a task that is pending or running.
pub type Task = Arc<LiveTask>;

#[derive(Debug)]
pub struct LiveTask {
    id: TaskId,
    job: String,
    kind: TaskKind,
    display_name: String,
    depends_on: Option<TaskId>,
    log_retention: Option<usize>,
    submitted_at: SystemTime,
    state: Mutex<TaskState>,
}

#[derive(Clone, Debug)]
struct TaskState {
    status: TaskStatus,
    pid: Option<u32>,
    progress: TaskProgress,
    started: Option<SystemTime>,
    ended: Option<SystemTime>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub job: String,
    pub name: String,
    pub kind: TaskKind,
    pub depends_on: Option<TaskId>,
    pub status: TaskStatus,
    pub pid: Option<u32>,
    pub progress: TaskProgress,
    pub percent: f64,
    pub started: Option<SystemTime>,
    pub ended: Option<SystemTime>,
}

impl LiveTask {
    pub fn new(job: impl Into<String>, kind: TaskKind) -> Self {
        let job = job.into();
        let display_name = kind.display_name(&job);
        Self {
            id: TaskId::new(),
            job,
            kind,
            display_name,
            depends_on: None,
            log_retention: None,
            submitted_at: SystemTime::now(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Queued,
                pid: None,
                progress: TaskProgress::default(),
                started: None,
                ended: None,
            }),
        }
    }

    pub fn depending_on(mut self, predecessor: TaskId) -> Self {
        self.depends_on = Some(predecessor);
        self
    }

    pub fn with_log_retention(mut self, keep_last: Option<usize>) -> Self {
        self.log_retention = keep_last;
        self
    }

    pub fn into_task(self) -> Task {
        Arc::new(self)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn depends_on(&self) -> Option<TaskId> {
        self.depends_on
    }

    pub fn log_retention(&self) -> Option<usize> {
        self.log_retention
    }

    pub fn submitted_at(&self) -> SystemTime {
        self.submitted_at
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        self.lock().pid = pid;
    }

    pub fn progress(&self) -> TaskProgress {
        self.lock().progress
    }

    pub fn set_progress(&self, progress: TaskProgress) {
        self.lock().progress = progress;
    }

    pub fn started(&self) -> Option<SystemTime> {
        self.lock().started
    }

    pub fn ended(&self) -> Option<SystemTime> {
        self.lock().ended
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.lock();
        state.status = TaskStatus::Running;
        state.started = Some(SystemTime::now());
    }

    pub(crate) fn mark_completed(&self, return_code: i32) -> SystemTime {
        let mut state = self.lock();
        let ended = SystemTime::now();
        state.status = TaskStatus::Completed(return_code);
        state.pid = None;
        state.ended = Some(ended);
        ended
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.lock().clone();
        TaskSnapshot {
            id: self.id,
            job: self.job.clone(),
            name: self.display_name.clone(),
            kind: self.kind.clone(),
            depends_on: self.depends_on,
            status: state.status,
            pid: state.pid,
            progress: state.progress,
            percent: state.progress.percent(),
            started: state.started,
            ended: state.ended,
        }
    }

    // State updates never leave the struct half-written, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
