use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use crate::models::{CoreError, TaskId};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::chain::{build_chain, script_task};
use crate::orchestration::queue::TaskQueue;
use crate::persistence::{StateStore, run_blocking};

pub type SubmitFuture<'a> =
    Pin<Box<dyn Future<Output = OrchestrationResult<Vec<TaskId>>> + Send + 'a>>;

/// Starts a run of a named job. The cron loop only needs this.
pub trait RunSubmitter: Send + Sync {
    fn submit_run<'a>(&'a self, job: &'a str) -> SubmitFuture<'a>;
}

#[derive(Clone)]
pub struct JobLauncher {
    store: Arc<dyn StateStore>,
    queue: TaskQueue,
}

impl JobLauncher {
    pub fn new(store: Arc<dyn StateStore>, queue: TaskQueue) -> Self {
        Self { store, queue }
    }

    /// Validates the job's configuration, marks it started and submits its
    /// chain. Nothing is submitted when a referenced definition is missing.
    pub async fn run_job(&self, name: &str, full_scan: bool) -> OrchestrationResult<Vec<TaskId>> {
        let owned = name.to_string();
        let mut job = run_blocking(&self.store, move |store| store.job(&owned))
            .await?
            .ok_or_else(|| CoreError::not_found("job", name))?;

        let backend_name = job.index_options.search_backend.clone();
        if run_blocking(&self.store, move |store| store.search_backend(&backend_name))
            .await?
            .is_none()
        {
            return Err(
                CoreError::not_found("search backend", &job.index_options.search_backend)
                    .for_job(name),
            );
        }

        for script in &job.user_scripts {
            let owned = script.clone();
            if run_blocking(&self.store, move |store| store.user_script(&owned))
                .await?
                .is_none()
            {
                return Err(CoreError::not_found("user script", script).for_job(name));
            }
        }

        if full_scan {
            job.do_full_scan = true;
        }
        job.mark_run_submitted()?;
        job.last_modified = SystemTime::now();

        let chain = build_chain(&job);
        run_blocking(&self.store, move |store| store.save_job(&job)).await?;

        let mut ids = Vec::with_capacity(chain.len());
        for task in chain {
            ids.push(self.queue.submit(task).await);
        }
        tracing::info!(job = name, tasks = ids.len(), full_scan, "job run submitted");
        Ok(ids)
    }

    pub async fn run_script(&self, script: &str, job: &str) -> OrchestrationResult<TaskId> {
        let owned_job = job.to_string();
        let job_record = run_blocking(&self.store, move |store| store.job(&owned_job))
            .await?
            .ok_or_else(|| CoreError::not_found("job", job))?;

        let owned_script = script.to_string();
        if run_blocking(&self.store, move |store| store.user_script(&owned_script))
            .await?
            .is_none()
        {
            return Err(CoreError::not_found("user script", script).for_job(job));
        }

        let id = self.queue.submit(script_task(&job_record, script)).await;
        tracing::info!(job, script, task_id = %id, "user script submitted");
        Ok(id)
    }
}

impl RunSubmitter for JobLauncher {
    fn submit_run<'a>(&'a self, job: &'a str) -> SubmitFuture<'a> {
        Box::pin(self.run_job(job, false))
    }
}
