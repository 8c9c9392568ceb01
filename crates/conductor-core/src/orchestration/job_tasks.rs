use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ConductorConfig;
use crate::execution::{
    CommandSpec, LogEventReceiver, ProcessExecutor, ProcessSpawnRequest, StdoutFormat,
    spawn_validated,
};
use crate::frontends::FrontendRegistry;
use crate::logs::{TaskLogSink, TaskLogs};
use crate::models::{Job, JobStatus, LogEvent, TaskKind};
use crate::orchestration::queue::{TaskExecutor, TaskFuture};
use crate::orchestration::task::Task;
use crate::persistence::{StateStore, run_blocking};

const INDEXER_LOG_FLAGS: [&str; 2] = ["--json-logs", "--very-verbose"];
const FAILED_TO_START: i32 = -1;

/// Runs scan, script and index tasks against the external indexer and
/// applies their effects to the owning job.
#[derive(Clone)]
pub struct JobTaskExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    store: Arc<dyn StateStore>,
    processes: Arc<dyn ProcessExecutor>,
    frontends: FrontendRegistry,
    logs: TaskLogs,
    config: ConductorConfig,
}

impl JobTaskExecutor {
    pub fn new(
        config: ConductorConfig,
        store: Arc<dyn StateStore>,
        processes: Arc<dyn ProcessExecutor>,
        frontends: FrontendRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                processes,
                frontends,
                logs: TaskLogs::new(config.log_dir()),
                config,
            }),
        }
    }
}

impl TaskExecutor for JobTaskExecutor {
    fn execute(&self, task: Task) -> TaskFuture {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut sink = TaskLogSink::open(inner.logs.path_for(task.id())).await;
            match task.kind().clone() {
                TaskKind::Scan => inner.run_scan(&task, &mut sink).await,
                TaskKind::Script { script } => inner.run_script(&task, &script, &mut sink).await,
                TaskKind::Index => inner.run_index(&task, &mut sink).await,
            }
        })
    }
}

impl ExecutorInner {
    async fn run_scan(&self, task: &Task, sink: &mut TaskLogSink) -> i32 {
        let Some(job) = self.load_job(task.job(), sink).await else {
            return FAILED_TO_START;
        };

        let artifact = match (&job.index_path, job.do_full_scan) {
            (Some(existing), false) => existing.clone(),
            _ => PathBuf::from(format!(
                "scan-{}-{}.idx",
                job.name.replace('/', "_"),
                unix_millis(SystemTime::now())
            )),
        };

        let mut args = job
            .scan_options
            .args(&self.config.artifact_path(&artifact), &job.name);
        args.extend(INDEXER_LOG_FLAGS.iter().map(|flag| flag.to_string()));
        let command = CommandSpec::new(&self.config.indexer).args(args);
        sink.diagnostic(format!("Starting scan: {}", command.describe()))
            .await;

        let return_code = self
            .run_process(task, command, StdoutFormat::Json, sink)
            .await;
        if return_code != 0 {
            return return_code;
        }

        let mut job = self.load_job(task.job(), sink).await.unwrap_or(job);
        job.index_path = Some(artifact.clone());
        job.last_index_date = Some(SystemTime::now());
        job.do_full_scan = false;

        if let Some(previous) = job.previous_index_path.take()
            && previous != artifact
        {
            remove_artifact(&self.config.artifact_path(&previous), sink).await;
        }
        job.previous_index_path = Some(artifact);

        self.save_job(job, sink).await;
        return_code
    }

    async fn run_script(&self, task: &Task, script_name: &str, sink: &mut TaskLogSink) -> i32 {
        let owned = script_name.to_string();
        let script = match run_blocking(&self.store, move |store| store.user_script(&owned)).await
        {
            Ok(Some(script)) => script,
            Ok(None) => {
                sink.diagnostic(format!("User script '{script_name}' does not exist"))
                    .await;
                return FAILED_TO_START;
            }
            Err(error) => {
                sink.diagnostic(error.message).await;
                return FAILED_TO_START;
            }
        };

        let Some(job) = self.load_job(task.job(), sink).await else {
            return FAILED_TO_START;
        };
        let Some(index_path) = &job.index_path else {
            sink.diagnostic(format!("Job '{}' has no index to run scripts on", job.name))
                .await;
            return FAILED_TO_START;
        };

        let extra_args = match script.split_extra_args() {
            Ok(args) => args,
            Err(error) => {
                sink.diagnostic(error.message).await;
                return FAILED_TO_START;
            }
        };

        let mut command = CommandSpec::new(&script.executable)
            .arg(self.config.artifact_path(index_path).display().to_string())
            .args(extra_args);
        let working_dir = script
            .working_dir
            .clone()
            .or_else(|| script.executable.parent().map(Path::to_path_buf))
            .filter(|dir| !dir.as_os_str().is_empty());
        if let Some(dir) = working_dir {
            command = command.working_dir(dir);
        }
        sink.diagnostic(format!("Starting user script: {}", command.describe()))
            .await;

        self.run_process(task, command, StdoutFormat::Text, sink)
            .await
    }

    async fn run_index(&self, task: &Task, sink: &mut TaskLogSink) -> i32 {
        let Some(job) = self.load_job(task.job(), sink).await else {
            return FAILED_TO_START;
        };

        let return_code = self.launch_index(task, &job, sink).await;
        self.finish_index(task.job(), return_code, sink).await;
        return_code
    }

    async fn launch_index(&self, task: &Task, job: &Job, sink: &mut TaskLogSink) -> i32 {
        let backend_name = job.index_options.search_backend.clone();
        let backend = match run_blocking(&self.store, move |store| {
            store.search_backend(&backend_name)
        })
        .await
        {
            Ok(Some(backend)) => backend,
            Ok(None) => {
                sink.diagnostic(format!(
                    "Search backend '{}' does not exist",
                    job.index_options.search_backend
                ))
                .await;
                return FAILED_TO_START;
            }
            Err(error) => {
                sink.diagnostic(error.message).await;
                return FAILED_TO_START;
            }
        };

        let Some(index_path) = &job.index_path else {
            sink.diagnostic(format!("Job '{}' has no index to load", job.name))
                .await;
            return FAILED_TO_START;
        };

        let mut args = backend.index_args(
            &self.config.artifact_path(index_path),
            job.index_options.threads,
            job.index_options.incremental,
        );
        args.extend(INDEXER_LOG_FLAGS.iter().map(|flag| flag.to_string()));
        let command = CommandSpec::new(&self.config.indexer).args(args);
        sink.diagnostic(format!("Starting index: {}", command.describe()))
            .await;

        self.run_process(task, command, StdoutFormat::Json, sink)
            .await
    }

    async fn finish_index(&self, job_name: &str, return_code: i32, sink: &mut TaskLogSink) {
        let Some(mut job) = self.load_job(job_name, sink).await else {
            return;
        };

        let next = if return_code == 0 {
            JobStatus::Indexed
        } else {
            JobStatus::Failed
        };
        if let Err(error) = job.transition_status(next) {
            tracing::warn!(job = job_name, error = %error, "job status left unchanged");
        }
        if return_code == 0 {
            job.previous_index_path = job.index_path.clone();
        }
        self.save_job(job, sink).await;

        if return_code == 0 {
            let restarted = self.frontends.restart_for_job(job_name).await;
            if !restarted.is_empty() {
                sink.diagnostic(format!("Restarted frontends: {}", restarted.join(", ")))
                    .await;
            }
        }
    }

    async fn run_process(
        &self,
        task: &Task,
        command: CommandSpec,
        stdout_format: StdoutFormat,
        sink: &mut TaskLogSink,
    ) -> i32 {
        let request = ProcessSpawnRequest::new(command)
            .task_id(task.id())
            .stdout_format(stdout_format);
        let process = match spawn_validated(self.processes.as_ref(), request) {
            Ok(process) => process,
            Err(error) => {
                tracing::warn!(task_id = %task.id(), error = %error, "failed to start task process");
                sink.diagnostic(error.message).await;
                return FAILED_TO_START;
            }
        };

        let pid = process.pid();
        task.set_pid(pid);
        tracing::debug!(task_id = %task.id(), pid = ?pid, "task process started");

        let events = process.take_log_events();
        let (_, result) = tokio::join!(drain_events(events, task, &mut *sink), process.wait());
        task.set_pid(None);

        match result {
            Ok(output) => output.status.code(),
            Err(error) => {
                sink.diagnostic(error.message).await;
                FAILED_TO_START
            }
        }
    }

    async fn load_job(&self, name: &str, sink: &mut TaskLogSink) -> Option<Job> {
        let owned = name.to_string();
        match run_blocking(&self.store, move |store| store.job(&owned)).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                sink.diagnostic(format!("Job '{name}' does not exist")).await;
                None
            }
            Err(error) => {
                sink.diagnostic(error.message).await;
                None
            }
        }
    }

    async fn save_job(&self, job: Job, sink: &mut TaskLogSink) {
        let name = job.name.clone();
        if let Err(error) = run_blocking(&self.store, move |store| store.save_job(&job)).await {
            tracing::error!(job = %name, error = %error, "failed to save job");
            sink.diagnostic(error.message).await;
        }
    }
}

async fn drain_events(events: Option<LogEventReceiver>, task: &Task, sink: &mut TaskLogSink) {
    let Some(mut events) = events else {
        return;
    };
    while let Some(event) = events.recv().await {
        match event {
            LogEvent::Progress(progress) => task.set_progress(progress),
            event => sink.write_event(&event).await,
        }
    }
}

async fn remove_artifact(path: &Path, sink: &mut TaskLogSink) {
    let result = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(error) => Err(error),
    };

    match result {
        Ok(()) => {
            sink.diagnostic(format!("Removed previous index {}", path.display()))
                .await;
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => {
            tracing::warn!(path = %path.display(), error = %error, "failed to remove previous index");
        }
    }
}

fn unix_millis(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or_default()
}
