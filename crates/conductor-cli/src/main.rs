use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand};
use conductor_core::config::ConductorConfig;
use conductor_core::execution::{ProcessExecutor, TokioProcessExecutor};
use conductor_core::frontends::FrontendRegistry;
use conductor_core::logs::{LogTail, TailEvent, TaskLogs};
use conductor_core::models::{CoreError, CoreErrorKind, TaskId, TaskRecord};
use conductor_core::notifications::NotificationBus;
use conductor_core::orchestration::{JobLauncher, JobTaskExecutor, TaskQueue};
use conductor_core::persistence::{JobStore, TaskRecordStore};
use conductor_core::schedule::CronScheduler;
use conductor_core::sqlite::SqliteStore;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const DEFAULT_TAIL_LINES: usize = 50;
const TAIL_POLL: Duration = Duration::from_millis(500);

type CliResult<T> = Result<T, CoreError>;

#[derive(Debug, Parser)]
#[command(
    name = "conductor",
    version,
    about = "Schedules and supervises scan, script and index job chains"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the queue, scheduler and frontends until interrupted
    Serve,
    /// Run one job to completion
    Run {
        job: String,
        /// Rescan everything instead of updating the previous index
        #[arg(long = "full")]
        full_scan: bool,
    },
    /// List jobs and their status
    Jobs,
    /// Print recent task records as JSON lines
    History {
        #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
    /// Print a task log, optionally following it
    Tail {
        task: TaskId,
        #[arg(short = 'n', long, default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,
        #[arg(short, long)]
        follow: bool,
    },
}

struct Services {
    store: Arc<SqliteStore>,
    queue: TaskQueue,
    launcher: JobLauncher,
    frontends: FrontendRegistry,
    notifications: NotificationBus,
}

#[derive(Serialize)]
struct HistoryRow<'a> {
    task_id: String,
    job: &'a str,
    name: &'a str,
    started: String,
    ended: String,
    return_code: i32,
    has_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(kind = ?error.kind, job = ?error.job, "{}", error.message);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command) -> CliResult<()> {
    let config = ConductorConfig::from_env()?;
    config.ensure_directories()?;
    let services = build_services(&config)?;

    match command {
        Command::Serve => serve(services).await,
        Command::Run { job, full_scan } => run_job(&services, &job, full_scan).await,
        Command::Jobs => list_jobs(&services),
        Command::History { limit } => print_history(&services, limit),
        Command::Tail {
            task,
            lines,
            follow,
        } => tail_log(&services, task, lines, follow).await,
    }
}

fn build_services(config: &ConductorConfig) -> CliResult<Services> {
    let store = Arc::new(SqliteStore::new(config.database_path()));
    store.migrate_to_latest()?;

    let processes: Arc<dyn ProcessExecutor> = Arc::new(TokioProcessExecutor);
    let frontends = FrontendRegistry::new(config.clone(), store.clone(), processes.clone());
    let executor = JobTaskExecutor::new(config.clone(), store.clone(), processes, frontends.clone());
    let notifications = NotificationBus::new();
    let queue = TaskQueue::new(
        config.queue_settings(),
        store.clone(),
        Arc::new(executor),
        TaskLogs::new(config.log_dir()),
        notifications.clone(),
    );
    let launcher = JobLauncher::new(store.clone(), queue.clone());

    Ok(Services {
        store,
        queue,
        launcher,
        frontends,
        notifications,
    })
}

async fn serve(services: Services) -> CliResult<()> {
    let queue_loop = services.queue.start();
    let scheduler =
        CronScheduler::new(services.store.clone(), Arc::new(services.launcher.clone())).spawn();

    let started = services.frontends.start_auto().await;
    tracing::info!(frontends = ?started, "conductor serving");

    let mut subscription = services.notifications.subscribe();
    let notifications = tokio::spawn(async move {
        while let Some(payload) = subscription.recv().await {
            tracing::info!(payload = %payload, "notification");
        }
    });

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for ctrl-c, shutting down");
    }
    tracing::info!("shutting down");

    scheduler.abort();
    queue_loop.abort();
    notifications.abort();
    services.frontends.stop_all().await;
    Ok(())
}

async fn run_job(services: &Services, job: &str, full_scan: bool) -> CliResult<()> {
    let ids = services.launcher.run_job(job, full_scan).await?;
    services.queue.run_until_idle().await;

    let mut failed = false;
    for id in ids {
        match services.store.task_record(id)? {
            Some(record) => {
                failed |= !record.succeeded();
                println!("{}", history_line(&record)?);
            }
            None => {
                failed = true;
                println!("{id} skipped");
            }
        }
    }

    if failed {
        return Err(
            CoreError::new(CoreErrorKind::ProcessFailure, "job run did not succeed").for_job(job),
        );
    }
    Ok(())
}

fn list_jobs(services: &Services) -> CliResult<()> {
    for job in services.store.list_jobs()? {
        let last_index = job
            .last_index_date
            .map(format_time)
            .transpose()?
            .unwrap_or_else(|| "never".to_string());
        let schedule = if job.schedule_enabled {
            job.schedule.as_str()
        } else {
            "disabled"
        };
        println!("{}\t{}\t{}\t{}", job.name, job.status, schedule, last_index);
    }
    Ok(())
}

fn print_history(services: &Services, limit: usize) -> CliResult<()> {
    for record in services.store.list_task_records(limit)? {
        println!("{}", history_line(&record)?);
    }
    Ok(())
}

async fn tail_log(services: &Services, task: TaskId, lines: usize, follow: bool) -> CliResult<()> {
    let mut tail = LogTail::open(services.queue.logs().path_for(task), lines).await?;
    loop {
        match tail.next_event().await? {
            TailEvent::Line(line) => println!("{line}"),
            TailEvent::NoData if follow => tokio::time::sleep(TAIL_POLL).await,
            TailEvent::NoData => return Ok(()),
        }
    }
}

fn history_line(record: &TaskRecord) -> CliResult<String> {
    let row = HistoryRow {
        task_id: record.id.to_string(),
        job: &record.job,
        name: &record.name,
        started: format_time(record.started)?,
        ended: format_time(record.ended)?,
        return_code: record.return_code,
        has_logs: record.has_logs,
    };
    serde_json::to_string(&row).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to encode task record: {error}"),
        )
    })
}

fn format_time(value: SystemTime) -> CliResult<String> {
    OffsetDateTime::from(value).format(&Rfc3339).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to format timestamp: {error}"),
        )
    })
}
