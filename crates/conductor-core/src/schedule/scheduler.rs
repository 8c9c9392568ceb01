use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;

use crate::orchestration::RunSubmitter;
use crate::persistence::{JobStore, run_blocking};
use crate::schedule::CronSchedule;

/// Minute-aligned loop that submits runs for every enabled job whose
/// schedule matches the current minute (UTC).
#[derive(Clone)]
pub struct CronScheduler {
    store: Arc<dyn JobStore>,
    submitter: Arc<dyn RunSubmitter>,
}

impl CronScheduler {
    pub fn new(store: Arc<dyn JobStore>, submitter: Arc<dyn RunSubmitter>) -> Self {
        Self { store, submitter }
    }

    /// Evaluates every job once. A job whose expression does not parse or
    /// whose submission fails is logged and skipped; the rest still run.
    /// Returns the names of the jobs that were submitted.
    pub async fn check_schedule(&self, now: OffsetDateTime) -> Vec<String> {
        let jobs = match run_blocking(&self.store, |store| store.list_jobs()).await {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::error!(error = %error, "failed to list jobs for schedule check");
                return Vec::new();
            }
        };

        let mut submitted = Vec::new();
        for job in jobs.into_iter().filter(|job| job.schedule_enabled) {
            let schedule = match CronSchedule::parse(&job.schedule) {
                Ok(schedule) => schedule,
                Err(error) => {
                    tracing::warn!(job = %job.name, error = %error, "skipping job with invalid schedule");
                    continue;
                }
            };
            if !schedule.matches(now) {
                continue;
            }

            tracing::info!(job = %job.name, schedule = %schedule, "scheduled run is due");
            match self.submitter.submit_run(&job.name).await {
                Ok(_) => submitted.push(job.name),
                Err(error) => {
                    tracing::warn!(job = %job.name, error = %error, "scheduled run was not submitted");
                }
            }
        }

        submitted
    }

    pub async fn run(self) {
        loop {
            tokio::time::sleep(until_next_minute(OffsetDateTime::now_utc())).await;
            self.check_schedule(OffsetDateTime::now_utc()).await;
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

pub fn until_next_minute(now: OffsetDateTime) -> Duration {
    let into_minute =
        Duration::from_secs(u64::from(now.second())) + Duration::from_nanos(u64::from(now.nanosecond()));
    Duration::from_secs(60).saturating_sub(into_minute)
}
