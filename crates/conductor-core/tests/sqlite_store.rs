use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use conductor_core::models::{
    CoreErrorKind, Frontend, Job, JobStatus, SearchBackend, TaskId, TaskRecord, UserScript,
};
use conductor_core::persistence::{DefinitionStore, JobStore, MigrationStore, TaskRecordStore};
use conductor_core::sqlite::{SqliteStore, current_schema_version};

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("conductor-{test_name}-{nanos}.sqlite3"))
}

fn migrated_store(test_name: &str) -> (SqliteStore, PathBuf) {
    let path = test_db_path(test_name);
    let store = SqliteStore::new(&path);
    store.migrate_to_latest().expect("migrations should apply");
    (store, path)
}

fn at_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

fn record(job: &str, started_ms: u64, return_code: i32, has_logs: bool) -> TaskRecord {
    TaskRecord {
        id: TaskId::new(),
        job: job.to_string(),
        name: format!("Scan [{job}]"),
        started: at_millis(started_ms),
        ended: at_millis(started_ms + 500),
        return_code,
        has_logs,
    }
}

#[test]
fn migrations_apply_forward_and_roll_back() {
    let path = test_db_path("sqlite-migrations");
    let store = SqliteStore::new(&path);

    assert_eq!(store.current_version().unwrap(), 0);
    assert_eq!(store.planned_migrations(0).len() as i64, current_schema_version());

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert!(store.planned_migrations(current_schema_version()).is_empty());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);
    let error = store.list_jobs().unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let error = store.apply_migration(current_schema_version() + 1).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let _ = std::fs::remove_file(path);
}

#[test]
fn jobs_round_trip_and_delete() {
    let (store, path) = migrated_store("sqlite-jobs");

    let mut job = Job::new_default("docs");
    job.scan_options.path = PathBuf::from("/srv/docs");
    job.scan_options.threads = 4;
    job.user_scripts = vec!["tagger".to_string(), "cleanup".to_string()];
    job.schedule = "*/15 * * * *".to_string();
    job.schedule_enabled = true;
    job.keep_last_logs = Some(3);
    job.index_path = Some(PathBuf::from("scan-docs-1.idx"));
    job.last_index_date = Some(at_millis(1_700_000_000_123));
    job.last_modified = at_millis(1_700_000_000_456);
    job.status = JobStatus::Indexed;
    store.save_job(&job).unwrap();

    let loaded = store.job("docs").unwrap().expect("job should exist");
    assert_eq!(loaded, job);

    job.status = JobStatus::Started;
    store.save_job(&job).unwrap();
    assert_eq!(store.job("docs").unwrap().unwrap().status, JobStatus::Started);

    store.save_job(&Job::new_default("archive")).unwrap();
    let names: Vec<String> = store.list_jobs().unwrap().into_iter().map(|job| job.name).collect();
    assert_eq!(names, vec!["archive", "docs"]);

    assert!(store.delete_job("docs").unwrap());
    assert!(!store.delete_job("docs").unwrap());
    assert!(store.job("docs").unwrap().is_none());

    let _ = std::fs::remove_file(path);
}

#[test]
fn task_records_list_newest_first_with_limit() {
    let (store, path) = migrated_store("sqlite-records");

    let first = record("docs", 1_000, 0, true);
    let second = record("docs", 2_000, 2, false);
    let third = record("archive", 3_000, 0, true);
    for entry in [&first, &second, &third] {
        store.insert_task_record(entry).unwrap();
    }

    let listed = store.list_task_records(10).unwrap();
    let ids: Vec<TaskId> = listed.iter().map(|record| record.id).collect();
    assert_eq!(ids, vec![third.id, second.id, first.id]);
    assert_eq!(listed[1], second);

    assert_eq!(store.list_task_records(2).unwrap().len(), 2);
    assert_eq!(store.task_record(first.id).unwrap(), Some(first.clone()));
    assert!(store.task_record(TaskId::new()).unwrap().is_none());

    store.clear_has_logs(first.id).unwrap();
    assert!(!store.task_record(first.id).unwrap().unwrap().has_logs);

    let _ = std::fs::remove_file(path);
}

#[test]
fn log_retention_selects_records_beyond_the_newest() {
    let (store, path) = migrated_store("sqlite-retention");

    let records: Vec<TaskRecord> = (0..5)
        .map(|index| record("docs", 1_000 + index * 1_000, 0, true))
        .collect();
    for entry in &records {
        store.insert_task_record(entry).unwrap();
    }
    store.insert_task_record(&record("docs", 10_000, 0, false)).unwrap();
    store.insert_task_record(&record("other", 500, 0, true)).unwrap();

    let expired = store.log_records_to_remove("docs", 2).unwrap();
    assert_eq!(expired, vec![records[2].id, records[1].id, records[0].id]);

    assert!(store.log_records_to_remove("docs", 5).unwrap().is_empty());
    assert_eq!(store.log_records_to_remove("docs", 0).unwrap().len(), 5);

    let _ = std::fs::remove_file(path);
}

#[test]
fn definitions_round_trip() {
    let (store, path) = migrated_store("sqlite-definitions");

    let script = UserScript {
        name: "tagger".to_string(),
        executable: PathBuf::from("/opt/scripts/tagger.sh"),
        working_dir: None,
        extra_args: "--verbose --tag 'two words'".to_string(),
    };
    store.save_user_script(&script).unwrap();
    assert_eq!(store.user_script("tagger").unwrap(), Some(script));
    assert!(store.user_script("missing").unwrap().is_none());

    let backend = SearchBackend::elasticsearch("es", "http://localhost:9200");
    store.save_search_backend(&backend).unwrap();
    assert_eq!(store.search_backend("es").unwrap(), Some(backend));

    let mut frontend = Frontend::new("public", "es");
    frontend.jobs = vec!["docs".to_string()];
    store.save_frontend(&frontend).unwrap();
    frontend.auto_start = true;
    store.save_frontend(&frontend).unwrap();
    assert_eq!(store.frontend("public").unwrap(), Some(frontend.clone()));
    assert_eq!(store.list_frontends().unwrap(), vec![frontend]);

    let _ = std::fs::remove_file(path);
}
