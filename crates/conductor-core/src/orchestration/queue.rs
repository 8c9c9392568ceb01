use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::execution::{ProcessTerminationMode, signal_process};
use crate::logs::TaskLogs;
use crate::models::{CoreError, CoreErrorKind, TaskId, TaskKind, TaskRecord};
use crate::notifications::{NotificationBus, index_completed};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::task::{Task, TaskSnapshot};
use crate::persistence::{TaskRecordStore, run_blocking};

const SKIPPED_HISTORY: usize = 256;

pub type TaskFuture = Pin<Box<dyn Future<Output = i32> + Send>>;

/// Runs one dispatched task to completion and reports its return code.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task) -> TaskFuture;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueSettings {
    pub concurrency_limit: usize,
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// A task that was dropped because its predecessor failed or was itself skipped.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SkippedTask {
    pub id: TaskId,
    pub job: String,
    pub name: String,
    pub dependency: TaskId,
    pub skipped_at: SystemTime,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    records: Arc<dyn TaskRecordStore>,
    executor: Arc<dyn TaskExecutor>,
    notifications: NotificationBus,
    logs: TaskLogs,
    settings: QueueSettings,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    live: HashMap<TaskId, Task>,
    running: usize,
    skipped: VecDeque<SkippedTask>,
    skipped_ids: HashSet<TaskId>,
}

enum Readiness {
    Ready,
    Waiting,
    Skip(TaskId),
}

impl TaskQueue {
    pub fn new(
        settings: QueueSettings,
        records: Arc<dyn TaskRecordStore>,
        executor: Arc<dyn TaskExecutor>,
        logs: TaskLogs,
        notifications: NotificationBus,
    ) -> Self {
        let settings = QueueSettings {
            concurrency_limit: settings.concurrency_limit.max(1),
            poll_interval: settings.poll_interval,
        };
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                records,
                executor,
                notifications,
                logs,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.inner.settings
    }

    pub fn logs(&self) -> &TaskLogs {
        &self.inner.logs
    }

    pub async fn submit(&self, task: Task) -> TaskId {
        let id = task.id();
        tracing::debug!(task_id = %id, job = task.job(), name = task.display_name(), "task submitted");
        self.inner.state.lock().await.pending.push_back(task);
        id
    }

    /// Starts the polling loop. It runs until the returned handle is aborted.
    pub fn start(&self) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                queue.dispatch_pending().await;
                tokio::time::sleep(queue.inner.settings.poll_interval).await;
            }
        })
    }

    /// Polls until nothing is pending or running.
    pub async fn run_until_idle(&self) {
        loop {
            self.dispatch_pending().await;
            if self.is_idle().await {
                return;
            }
            tokio::time::sleep(self.inner.settings.poll_interval).await;
        }
    }

    /// One scheduling pass over the pending list, in submission order. The
    /// state lock is held across the dependency lookups so a task can never be
    /// dispatched twice.
    pub async fn dispatch_pending(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let mut dispatched = 0;
        let mut index = 0;

        while index < state.pending.len() {
            if state.running >= self.inner.settings.concurrency_limit {
                break;
            }

            let task = Arc::clone(&state.pending[index]);
            match self.readiness(&state, &task).await {
                Readiness::Waiting => index += 1,
                Readiness::Skip(dependency) => {
                    state.pending.remove(index);
                    skip_task(&mut state, &task, dependency);
                }
                Readiness::Ready => {
                    state.pending.remove(index);
                    state.running += 1;
                    state.live.insert(task.id(), Arc::clone(&task));
                    task.mark_running();
                    tracing::info!(task_id = %task.id(), job = task.job(), name = task.display_name(), "task started");

                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(run_task(inner, task));
                    dispatched += 1;
                }
            }
        }

        prune_skipped_ids(&mut state);
        dispatched
    }

    async fn readiness(&self, state: &QueueState, task: &Task) -> Readiness {
        let Some(dependency) = task.depends_on() else {
            return Readiness::Ready;
        };

        if state.skipped_ids.contains(&dependency) {
            return Readiness::Skip(dependency);
        }

        match run_blocking(&self.inner.records, move |records| {
            records.task_record(dependency)
        })
        .await
        {
            Ok(Some(record)) if record.succeeded() => Readiness::Ready,
            Ok(Some(_)) => Readiness::Skip(dependency),
            Ok(None) => Readiness::Waiting,
            Err(error) => {
                tracing::warn!(
                    task_id = %task.id(),
                    dependency = %dependency,
                    error = %error,
                    "failed to look up dependency record"
                );
                Readiness::Waiting
            }
        }
    }

    /// Sends a termination signal to a running task. Returns whether the task
    /// is live. Completion is still observed through the normal path.
    pub async fn kill(&self, id: TaskId) -> bool {
        let pid = {
            let state = self.inner.state.lock().await;
            match state.live.get(&id) {
                Some(task) => task.pid(),
                None => return false,
            }
        };
        let Some(pid) = pid else {
            tracing::warn!(task_id = %id, "task has no process to signal yet");
            return true;
        };

        if let Err(error) = signal_process(pid, ProcessTerminationMode::Graceful) {
            tracing::warn!(task_id = %id, pid, error = %error, "failed to signal task process");
        }
        true
    }

    /// Pending tasks in submission order followed by running ones.
    pub async fn tasks(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock().await;
        let mut snapshots: Vec<TaskSnapshot> =
            state.pending.iter().map(|task| task.snapshot()).collect();
        let mut running: Vec<TaskSnapshot> =
            state.live.values().map(|task| task.snapshot()).collect();
        running.sort_by_key(|snapshot| snapshot.started);
        snapshots.extend(running);
        snapshots
    }

    pub async fn running_count(&self) -> usize {
        self.inner.state.lock().await.running
    }

    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.pending.is_empty() && state.running == 0
    }

    pub async fn skipped_tasks(&self) -> Vec<SkippedTask> {
        self.inner
            .state
            .lock()
            .await
            .skipped
            .iter()
            .cloned()
            .collect()
    }

    pub async fn delete_task_logs(&self, id: TaskId) -> OrchestrationResult<()> {
        let record = run_blocking(&self.inner.records, move |records| records.task_record(id))
            .await?
            .ok_or_else(|| CoreError::not_found("task", &id.to_string()).for_task(id))?;

        self.inner.logs.delete(id).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("failed to delete log of task '{id}': {error}"),
            )
            .for_task(id)
            .for_job(record.job.clone())
        })?;

        run_blocking(&self.inner.records, move |records| records.clear_has_logs(id)).await
    }
}

fn skip_task(state: &mut QueueState, task: &Task, dependency: TaskId) {
    tracing::warn!(
        task_id = %task.id(),
        job = task.job(),
        name = task.display_name(),
        dependency = %dependency,
        "skipping task because its dependency did not succeed"
    );

    state.skipped_ids.insert(task.id());
    state.skipped.push_back(SkippedTask {
        id: task.id(),
        job: task.job().to_string(),
        name: task.display_name().to_string(),
        dependency,
        skipped_at: SystemTime::now(),
    });

    while state.skipped.len() > SKIPPED_HISTORY {
        state.skipped.pop_front();
    }
}

/// Forgets skipped ids that fell out of the history once no pending task
/// still waits on them.
fn prune_skipped_ids(state: &mut QueueState) {
    if state.skipped_ids.len() <= state.skipped.len() {
        return;
    }

    let retained: HashSet<TaskId> = state
        .skipped
        .iter()
        .map(|skipped| skipped.id)
        .chain(state.pending.iter().filter_map(|task| task.depends_on()))
        .collect();
    state.skipped_ids.retain(|id| retained.contains(id));
}

async fn run_task(inner: Arc<QueueInner>, task: Task) {
    let executor = Arc::clone(&inner.executor);
    let running = Arc::clone(&task);
    let return_code = match tokio::spawn(async move { executor.execute(running).await }).await {
        Ok(code) => code,
        Err(error) => {
            tracing::error!(task_id = %task.id(), job = task.job(), error = %error, "task executor aborted");
            -1
        }
    };

    complete_task(&inner, &task, return_code).await;
}

async fn complete_task(inner: &Arc<QueueInner>, task: &Task, return_code: i32) {
    let ended = task.mark_completed(return_code);
    let record = TaskRecord {
        id: task.id(),
        job: task.job().to_string(),
        name: task.display_name().to_string(),
        started: task.started().unwrap_or(ended),
        ended,
        return_code,
        has_logs: inner.logs.exists(task.id()),
    };

    if let Err(error) = run_blocking(&inner.records, move |records| {
        records.insert_task_record(&record)
    })
    .await
    {
        tracing::error!(task_id = %task.id(), job = task.job(), error = %error, "failed to persist task record");
    }

    tracing::info!(task_id = %task.id(), job = task.job(), return_code, "task completed");

    if let Some(keep) = task.log_retention() {
        apply_log_retention(inner, task.job(), keep).await;
    }

    if *task.kind() == TaskKind::Index && return_code == 0 {
        inner.notifications.notify(index_completed(task.job()));
    }

    // The slot is released last so an idle queue has no bookkeeping in flight.
    let mut state = inner.state.lock().await;
    state.live.remove(&task.id());
    state.running = state.running.saturating_sub(1);
}

async fn apply_log_retention(inner: &Arc<QueueInner>, job: &str, keep: usize) {
    let owned_job = job.to_string();
    let expired = match run_blocking(&inner.records, move |records| {
        records.log_records_to_remove(&owned_job, keep)
    })
    .await
    {
        Ok(expired) => expired,
        Err(error) => {
            tracing::warn!(job, error = %error, "failed to evaluate log retention");
            return;
        }
    };

    for id in expired {
        if let Err(error) = inner.logs.delete(id) {
            tracing::warn!(task_id = %id, job, error = %error, "failed to delete expired task log");
            continue;
        }
        if let Err(error) =
            run_blocking(&inner.records, move |records| records.clear_has_logs(id)).await
        {
            tracing::warn!(task_id = %id, job, error = %error, "failed to clear has_logs");
        }
    }
}
