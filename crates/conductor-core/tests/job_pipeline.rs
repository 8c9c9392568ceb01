#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use conductor_core::config::ConductorConfig;
use conductor_core::execution::{ProcessExecutor, TokioProcessExecutor};
use conductor_core::frontends::FrontendRegistry;
use conductor_core::logs::TaskLogs;
use conductor_core::models::{
    CoreErrorKind, Frontend, Job, JobStatus, SearchBackend, TaskId, UserScript,
};
use conductor_core::notifications::{NotificationBus, Subscription};
use conductor_core::orchestration::{JobLauncher, JobTaskExecutor, TaskQueue};
use conductor_core::persistence::{DefinitionStore, JobStore, TaskRecordStore};
use conductor_core::sqlite::SqliteStore;

const FAKE_INDEXER: &str = r##"#!/bin/sh
case "$1" in
scan)
    case "$2" in
    *failing*)
        echo '{"message": "scan failed"}'
        exit 2
        ;;
    esac
    for arg in "$@"; do
        case "$arg" in
        --output=*) echo "index" > "${arg#--output=}" ;;
        esac
    done
    echo '$PROGRESS {"done": 1, "total": 1}'
    echo '{"message": "scan complete"}'
    ;;
web)
    echo '{"message": "listening"}'
    exec sleep 30
    ;;
*)
    case "$*" in
    *failing*)
        echo 'index failed' >&2
        exit 4
        ;;
    esac
    echo '{"message": "index loaded"}'
    ;;
esac
exit 0
"##;

const FAKE_SCRIPT: &str = r##"#!/bin/sh
echo "tagging $1"
if [ "$2" = "--exit" ]; then
    exit "$3"
fi
exit 0
"##;

struct FakeTools {
    indexer: PathBuf,
    script: PathBuf,
}

// Written once per test binary: exec of a file that a forked child still holds
// open for writing fails with ETXTBSY.
fn fake_tools() -> &'static FakeTools {
    static TOOLS: OnceLock<FakeTools> = OnceLock::new();
    TOOLS.get_or_init(|| {
        let dir = std::env::temp_dir().join(format!("conductor-fake-tools-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        FakeTools {
            indexer: write_executable(&dir.join("indexer.sh"), FAKE_INDEXER),
            script: write_executable(&dir.join("tagger.sh"), FAKE_SCRIPT),
        }
    })
}

fn write_executable(path: &Path, contents: &str) -> PathBuf {
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

fn test_dir(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("conductor-{test_name}-{nanos}"))
}

struct Pipeline {
    config: ConductorConfig,
    store: Arc<SqliteStore>,
    queue: TaskQueue,
    launcher: JobLauncher,
    frontends: FrontendRegistry,
    notifications: NotificationBus,
    logs: TaskLogs,
}

impl Pipeline {
    fn new(test_name: &str) -> Self {
        let tools = fake_tools();
        let mut config = ConductorConfig::with_data_dir(test_dir(test_name));
        config.indexer = tools.indexer.clone();
        config.poll_interval = Duration::from_millis(10);
        config.frontend_stop_grace = Duration::from_secs(2);
        config.ensure_directories().unwrap();

        let store = Arc::new(SqliteStore::new(config.database_path()));
        store.migrate_to_latest().unwrap();

        let processes: Arc<dyn ProcessExecutor> = Arc::new(TokioProcessExecutor);
        let frontends = FrontendRegistry::new(config.clone(), store.clone(), processes.clone());
        let executor =
            JobTaskExecutor::new(config.clone(), store.clone(), processes, frontends.clone());
        let notifications = NotificationBus::new();
        let logs = TaskLogs::new(config.log_dir());
        let queue = TaskQueue::new(
            config.queue_settings(),
            store.clone(),
            Arc::new(executor),
            logs.clone(),
            notifications.clone(),
        );
        let launcher = JobLauncher::new(store.clone(), queue.clone());

        store
            .save_search_backend(&SearchBackend::sqlite(
                "local",
                config.data_dir.join("search.db"),
            ))
            .unwrap();
        store
            .save_search_backend(&SearchBackend::sqlite(
                "broken",
                config.data_dir.join("failing-search.db"),
            ))
            .unwrap();

        Self {
            config,
            store,
            queue,
            launcher,
            frontends,
            notifications,
            logs,
        }
    }

    fn add_job(&self, name: &str, scan_path: &str, backend: &str, scripts: &[&str]) {
        let mut job = Job::new_default(name);
        job.scan_options.path = PathBuf::from(scan_path);
        job.index_options.search_backend = backend.to_string();
        job.user_scripts = scripts.iter().map(|script| script.to_string()).collect();
        self.store.save_job(&job).unwrap();
    }

    fn add_script(&self, name: &str, extra_args: &str) {
        self.store
            .save_user_script(&UserScript {
                name: name.to_string(),
                executable: fake_tools().script.clone(),
                working_dir: Some(self.config.data_dir.clone()),
                extra_args: extra_args.to_string(),
            })
            .unwrap();
    }

    fn job(&self, name: &str) -> Job {
        self.store.job(name).unwrap().expect("job should exist")
    }

    fn return_code(&self, id: TaskId) -> Option<i32> {
        self.store
            .task_record(id)
            .unwrap()
            .map(|record| record.return_code)
    }

    fn task_log(&self, id: TaskId) -> String {
        std::fs::read_to_string(self.logs.path_for(id)).unwrap_or_default()
    }

    async fn run(&self, job: &str, full_scan: bool) -> Vec<TaskId> {
        let ids = self.launcher.run_job(job, full_scan).await.unwrap();
        tokio::time::timeout(Duration::from_secs(20), self.queue.run_until_idle())
            .await
            .expect("job run should finish");
        ids
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.config.data_dir);
    }
}

fn notifications_received(subscription: &mut Subscription) -> Vec<serde_json::Value> {
    std::iter::from_fn(|| subscription.try_recv()).collect()
}

#[tokio::test]
async fn successful_run_indexes_job_and_notifies_once() {
    let pipeline = Pipeline::new("pipeline-success");
    pipeline.add_job("docs", "/srv/docs", "local", &[]);
    let mut subscription = pipeline.notifications.subscribe();

    let ids = pipeline.run("docs", false).await;

    assert_eq!(ids.len(), 2);
    assert_eq!(pipeline.return_code(ids[0]), Some(0));
    assert_eq!(pipeline.return_code(ids[1]), Some(0));

    let job = pipeline.job("docs");
    assert_eq!(job.status, JobStatus::Indexed);
    assert!(!job.do_full_scan);
    assert!(job.last_index_date.is_some());
    let index_path = job.index_path.clone().expect("scan should record its index");
    assert!(index_path.to_string_lossy().starts_with("scan-docs-"));
    assert!(pipeline.config.artifact_path(&index_path).is_file());
    assert_eq!(job.previous_index_path, Some(index_path));

    let scan_log = pipeline.task_log(ids[0]);
    assert!(scan_log.contains("Starting scan"));
    assert!(scan_log.contains("--json-logs"));
    assert!(scan_log.contains("scan complete"));
    assert!(!scan_log.contains("$PROGRESS"));
    assert!(pipeline.task_log(ids[1]).contains("index loaded"));
    assert!(pipeline.store.task_record(ids[0]).unwrap().unwrap().has_logs);

    let received = notifications_received(&mut subscription);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["message"], "indexCompleted");
    assert_eq!(received[0]["job"], "docs");

    pipeline.cleanup();
}

#[tokio::test]
async fn full_scan_replaces_and_removes_previous_index() {
    let pipeline = Pipeline::new("pipeline-full-scan");
    pipeline.add_job("docs", "/srv/docs", "local", &[]);

    pipeline.run("docs", false).await;
    let first = pipeline.job("docs").index_path.unwrap();

    pipeline.run("docs", false).await;
    assert_eq!(pipeline.job("docs").index_path, Some(first.clone()));

    pipeline.run("docs", true).await;
    let job = pipeline.job("docs");
    let second = job.index_path.clone().unwrap();
    assert_ne!(second, first);
    assert!(pipeline.config.artifact_path(&second).is_file());
    assert!(!pipeline.config.artifact_path(&first).exists());
    assert_eq!(job.status, JobStatus::Indexed);

    pipeline.cleanup();
}

#[tokio::test]
async fn failed_scan_skips_index_and_keeps_job_started() {
    let pipeline = Pipeline::new("pipeline-scan-failure");
    pipeline.add_job("docs", "/srv/failing", "local", &[]);
    let mut subscription = pipeline.notifications.subscribe();

    let ids = pipeline.run("docs", false).await;

    assert_eq!(pipeline.return_code(ids[0]), Some(2));
    assert_eq!(pipeline.return_code(ids[1]), None);
    assert!(pipeline.task_log(ids[0]).contains("scan failed"));

    let skipped = pipeline.queue.skipped_tasks().await;
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].id, ids[1]);

    let job = pipeline.job("docs");
    assert_eq!(job.status, JobStatus::Started);
    assert_eq!(job.index_path, None);
    assert!(notifications_received(&mut subscription).is_empty());

    pipeline.cleanup();
}

#[tokio::test]
async fn failed_index_marks_job_failed_without_notification() {
    let pipeline = Pipeline::new("pipeline-index-failure");
    pipeline.add_job("docs", "/srv/docs", "broken", &[]);
    let mut subscription = pipeline.notifications.subscribe();

    let ids = pipeline.run("docs", false).await;

    assert_eq!(pipeline.return_code(ids[0]), Some(0));
    assert_eq!(pipeline.return_code(ids[1]), Some(4));
    assert!(pipeline.task_log(ids[1]).contains("index failed"));
    assert_eq!(pipeline.job("docs").status, JobStatus::Failed);
    assert!(notifications_received(&mut subscription).is_empty());

    pipeline.add_job("docs", "/srv/docs", "local", &[]);
    let mut job = pipeline.job("docs");
    job.status = JobStatus::Failed;
    pipeline.store.save_job(&job).unwrap();
    pipeline.run("docs", false).await;
    assert_eq!(pipeline.job("docs").status, JobStatus::Indexed);

    pipeline.cleanup();
}

#[tokio::test]
async fn user_scripts_run_between_scan_and_index() {
    let pipeline = Pipeline::new("pipeline-scripts");
    pipeline.add_script("tagger", "");
    pipeline.add_script("strict", "--exit 3");
    pipeline.add_job("docs", "/srv/docs", "local", &["tagger"]);

    let ids = pipeline.run("docs", false).await;
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| pipeline.return_code(*id) == Some(0)));

    let index_path = pipeline.job("docs").index_path.unwrap();
    let script_log = pipeline.task_log(ids[1]);
    assert!(script_log.contains(&format!(
        "tagging {}",
        pipeline.config.artifact_path(&index_path).display()
    )));

    pipeline.add_job("docs", "/srv/docs", "local", &["strict", "tagger"]);
    let ids = pipeline.run("docs", false).await;
    assert_eq!(ids.len(), 4);
    assert_eq!(pipeline.return_code(ids[0]), Some(0));
    assert_eq!(pipeline.return_code(ids[1]), Some(3));
    assert_eq!(pipeline.return_code(ids[2]), None);
    assert_eq!(pipeline.return_code(ids[3]), None);

    pipeline.cleanup();
}

#[tokio::test]
async fn standalone_script_needs_an_existing_index() {
    let pipeline = Pipeline::new("pipeline-standalone-script");
    pipeline.add_script("tagger", "");
    pipeline.add_job("docs", "/srv/docs", "local", &[]);

    let id = pipeline.launcher.run_script("tagger", "docs").await.unwrap();
    pipeline.queue.run_until_idle().await;
    assert_eq!(pipeline.return_code(id), Some(-1));
    assert!(pipeline.task_log(id).contains("has no index"));

    pipeline.run("docs", false).await;
    let id = pipeline.launcher.run_script("tagger", "docs").await.unwrap();
    pipeline.queue.run_until_idle().await;
    assert_eq!(pipeline.return_code(id), Some(0));

    let error = pipeline
        .launcher
        .run_script("missing", "docs")
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);

    pipeline.cleanup();
}

#[tokio::test]
async fn run_with_missing_definitions_submits_nothing() {
    let pipeline = Pipeline::new("pipeline-missing-definitions");
    pipeline.add_job("docs", "/srv/docs", "nowhere", &[]);
    pipeline.add_job("scripted", "/srv/docs", "local", &["missing"]);

    let error = pipeline.launcher.run_job("docs", false).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);
    assert_eq!(error.job.as_deref(), Some("docs"));

    let error = pipeline
        .launcher
        .run_job("scripted", false)
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);

    let error = pipeline.launcher.run_job("ghost", false).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NotFound);

    assert!(pipeline.queue.is_idle().await);
    assert_eq!(pipeline.job("docs").status, JobStatus::Created);

    pipeline.cleanup();
}

#[tokio::test]
async fn frontends_restart_after_their_job_is_reindexed() {
    let pipeline = Pipeline::new("pipeline-frontends");
    pipeline.add_job("docs", "/srv/docs", "local", &[]);
    let mut frontend = Frontend::new("public", "local");
    frontend.jobs = vec!["docs".to_string()];
    pipeline.store.save_frontend(&frontend).unwrap();

    let error = pipeline.frontends.start("public").await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);

    pipeline.run("docs", false).await;
    let first_pid = pipeline.frontends.start("public").await.unwrap();
    assert!(first_pid.is_some());
    assert!(pipeline.frontends.is_running("public").await);
    assert_eq!(pipeline.frontends.running().await, vec!["public"]);

    let error = pipeline.frontends.start("public").await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);

    pipeline.run("docs", false).await;
    let second_pid = pipeline.frontends.pid("public").await;
    assert!(second_pid.is_some());
    assert_ne!(second_pid, first_pid);

    assert!(pipeline.frontends.stop("public").await);
    assert!(!pipeline.frontends.is_running("public").await);
    assert!(!pipeline.frontends.stop("public").await);

    let frontend_log =
        std::fs::read_to_string(pipeline.logs.frontend_path("public")).unwrap_or_default();
    assert!(frontend_log.contains("listening"));

    pipeline.cleanup();
}
