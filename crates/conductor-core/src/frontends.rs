use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ConductorConfig;
use crate::execution::{
    CommandSpec, LogEventReceiver, ProcessExecutor, ProcessSpawnRequest, ProcessTerminationMode,
    RunningProcess, StdoutFormat, signal_process, spawn_validated,
};
use crate::logs::{TaskLogSink, TaskLogs};
use crate::models::{CoreError, CoreErrorKind, Frontend};
use crate::orchestration::OrchestrationResult;
use crate::persistence::{StateStore, run_blocking};

const FORCED_STOP_WAIT: Duration = Duration::from_secs(1);

/// Owns every running frontend process. Cloning shares the same registry.
#[derive(Clone)]
pub struct FrontendRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    running: Mutex<HashMap<String, RunningFrontend>>,
    next_generation: AtomicU64,
    store: Arc<dyn StateStore>,
    processes: Arc<dyn ProcessExecutor>,
    logs: TaskLogs,
    config: ConductorConfig,
}

struct RunningFrontend {
    pid: Option<u32>,
    generation: u64,
    jobs: Vec<String>,
    supervisor: JoinHandle<()>,
}

impl FrontendRegistry {
    pub fn new(
        config: ConductorConfig,
        store: Arc<dyn StateStore>,
        processes: Arc<dyn ProcessExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                running: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                store,
                processes,
                logs: TaskLogs::new(config.log_dir()),
                config,
            }),
        }
    }

    /// Launches the named frontend over the current index of each of its jobs.
    pub async fn start(&self, name: &str) -> OrchestrationResult<Option<u32>> {
        let mut running = self.inner.running.lock().await;
        if running.contains_key(name) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("frontend '{name}' is already running"),
            ));
        }

        let owned_name = name.to_string();
        let frontend = run_blocking(&self.inner.store, move |store| store.frontend(&owned_name))
            .await?
            .ok_or_else(|| CoreError::not_found("frontend", name))?;

        let backend_name = frontend.search_backend.clone();
        let backend = run_blocking(&self.inner.store, move |store| {
            store.search_backend(&backend_name)
        })
        .await?
        .ok_or_else(|| CoreError::not_found("search backend", &frontend.search_backend))?;

        let indices = self.index_paths(&frontend).await?;
        if indices.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("frontend '{name}' has no built index to serve"),
            ));
        }

        let command = CommandSpec::new(&self.inner.config.indexer)
            .args(frontend.web_args(&backend, &indices));
        tracing::info!(frontend = name, command = %command.describe(), "starting frontend");

        let process = spawn_validated(
            self.inner.processes.as_ref(),
            ProcessSpawnRequest::new(command).stdout_format(StdoutFormat::Json),
        )?;
        let pid = process.pid();
        let events = process.take_log_events();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let supervisor = tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            name.to_string(),
            generation,
            process,
            events,
            self.inner.logs.frontend_path(name),
        ));

        running.insert(
            name.to_string(),
            RunningFrontend {
                pid,
                generation,
                jobs: frontend.jobs.clone(),
                supervisor,
            },
        );

        Ok(pid)
    }

    /// Terminates the named frontend and waits for it to exit, escalating to
    /// a kill once the configured grace period runs out.
    pub async fn stop(&self, name: &str) -> bool {
        let Some(mut frontend) = self.inner.running.lock().await.remove(name) else {
            return false;
        };

        let Some(pid) = frontend.pid else {
            frontend.supervisor.abort();
            return true;
        };

        if let Err(error) = signal_process(pid, ProcessTerminationMode::Graceful) {
            tracing::warn!(frontend = name, pid, error = %error, "failed to signal frontend");
        }

        if tokio::time::timeout(self.inner.config.frontend_stop_grace, &mut frontend.supervisor)
            .await
            .is_err()
        {
            tracing::warn!(frontend = name, pid, "frontend ignored termination, killing it");
            let _ = signal_process(pid, ProcessTerminationMode::Immediate);
            if tokio::time::timeout(FORCED_STOP_WAIT, &mut frontend.supervisor)
                .await
                .is_err()
            {
                frontend.supervisor.abort();
            }
        }

        true
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.inner.running.lock().await.contains_key(name)
    }

    pub async fn pid(&self, name: &str) -> Option<u32> {
        self.inner
            .running
            .lock()
            .await
            .get(name)
            .and_then(|frontend| frontend.pid)
    }

    pub async fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.running.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Restarts every running frontend that serves `job`, so it picks up the
    /// job's new index. Returns the names that came back up.
    pub async fn restart_for_job(&self, job: &str) -> Vec<String> {
        let affected: Vec<String> = {
            let running = self.inner.running.lock().await;
            let mut names: Vec<String> = running
                .iter()
                .filter(|(_, frontend)| frontend.jobs.iter().any(|name| name == job))
                .map(|(name, _)| name.clone())
                .collect();
            names.sort();
            names
        };

        let mut restarted = Vec::with_capacity(affected.len());
        for name in affected {
            self.stop(&name).await;
            match self.start(&name).await {
                Ok(_) => restarted.push(name),
                Err(error) => {
                    tracing::warn!(frontend = %name, job, error = %error, "failed to restart frontend");
                }
            }
        }
        restarted
    }

    /// Starts every stored frontend marked `auto_start`.
    pub async fn start_auto(&self) -> Vec<String> {
        let frontends = match run_blocking(&self.inner.store, |store| store.list_frontends()).await
        {
            Ok(frontends) => frontends,
            Err(error) => {
                tracing::warn!(error = %error, "failed to list frontends for auto start");
                return Vec::new();
            }
        };

        let mut started = Vec::new();
        for frontend in frontends.into_iter().filter(|frontend| frontend.auto_start) {
            match self.start(&frontend.name).await {
                Ok(_) => started.push(frontend.name),
                Err(error) => {
                    tracing::warn!(frontend = %frontend.name, error = %error, "failed to auto start frontend");
                }
            }
        }
        started
    }

    pub async fn stop_all(&self) {
        for name in self.running().await {
            self.stop(&name).await;
        }
    }

    async fn index_paths(&self, frontend: &Frontend) -> OrchestrationResult<Vec<PathBuf>> {
        let mut indices = Vec::with_capacity(frontend.jobs.len());
        for job_name in &frontend.jobs {
            let owned = job_name.clone();
            match run_blocking(&self.inner.store, move |store| store.job(&owned)).await? {
                Some(job) => {
                    if let Some(index_path) = &job.index_path {
                        indices.push(self.inner.config.artifact_path(index_path));
                    }
                }
                None => {
                    tracing::warn!(frontend = %frontend.name, job = %job_name, "frontend references a missing job");
                }
            }
        }
        Ok(indices)
    }
}

async fn supervise(
    registry: Weak<RegistryInner>,
    name: String,
    generation: u64,
    process: Box<dyn RunningProcess>,
    events: Option<LogEventReceiver>,
    log_path: PathBuf,
) {
    let mut sink = TaskLogSink::open(log_path).await;
    let drain = async {
        if let Some(mut events) = events {
            while let Some(event) = events.recv().await {
                sink.write_event(&event).await;
            }
        }
    };
    let (_, result) = tokio::join!(drain, process.wait());

    match result {
        Ok(output) => {
            tracing::info!(frontend = %name, return_code = output.status.code(), "frontend exited");
        }
        Err(error) => {
            tracing::warn!(frontend = %name, error = %error, "lost track of frontend process");
        }
    }

    if let Some(registry) = registry.upgrade() {
        let mut running = registry.running.lock().await;
        if running
            .get(&name)
            .is_some_and(|frontend| frontend.generation == generation)
        {
            running.remove(&name);
        }
    }
}
