use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::{
    CoreError, CoreErrorKind, Frontend, Job, JobStatus, SearchBackend, TaskId, TaskRecord,
    UserScript,
};
use crate::persistence::{
    DefinitionStore, JobStore, MigrationStore, PersistenceResult, TaskRecordStore,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "conductor_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "name, status, schedule, schedule_enabled, keep_last_logs, index_path, \
previous_index_path, last_index_unix_ms, do_full_scan, last_modified_unix_ms, user_scripts_json, \
scan_options_json, index_options_json";

const TASK_RECORD_COLUMNS: &str =
    "task_id, job_name, name, started_unix_ms, ended_unix_ms, return_code, has_logs";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }

    fn save_definition<T: Serialize>(
        &self,
        operation_name: &str,
        table: &str,
        name: &str,
        definition: &T,
    ) -> PersistenceResult<()> {
        self.with_connection(operation_name, |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                &format!(
                    "
INSERT INTO {table} (name, definition_json) VALUES (?1, ?2)
ON CONFLICT(name) DO UPDATE SET definition_json = excluded.definition_json
"
                ),
                params![name, to_json(definition)?],
            )?;
            Ok(())
        })
    }

    fn load_definition<T: DeserializeOwned>(
        &self,
        operation_name: &str,
        table: &str,
        name: &str,
    ) -> PersistenceResult<Option<T>> {
        self.with_connection(operation_name, |connection| {
            ensure_schema_ready(connection)?;
            let raw: Option<String> = connection
                .query_row(
                    &format!("SELECT definition_json FROM {table} WHERE name = ?1"),
                    [name],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| from_json(&raw)).transpose()
        })
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // All DDL is IF NOT EXISTS, so re-running it repairs a database
                // whose version row survived without its tables.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl JobStore for SqliteStore {
    fn job(&self, name: &str) -> PersistenceResult<Option<Job>> {
        self.with_connection("job", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
                    [name],
                    job_from_row,
                )
                .optional()
        })
    }

    fn list_jobs(&self) -> PersistenceResult<Vec<Job>> {
        self.with_connection("list_jobs", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement =
                connection.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY name"))?;
            let rows = statement.query_map([], job_from_row)?;
            rows.collect()
        })
    }

    fn save_job(&self, job: &Job) -> PersistenceResult<()> {
        self.with_connection("save_job", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                &format!(
                    "
INSERT INTO jobs ({JOB_COLUMNS})
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
ON CONFLICT(name) DO UPDATE SET
    status = excluded.status,
    schedule = excluded.schedule,
    schedule_enabled = excluded.schedule_enabled,
    keep_last_logs = excluded.keep_last_logs,
    index_path = excluded.index_path,
    previous_index_path = excluded.previous_index_path,
    last_index_unix_ms = excluded.last_index_unix_ms,
    do_full_scan = excluded.do_full_scan,
    last_modified_unix_ms = excluded.last_modified_unix_ms,
    user_scripts_json = excluded.user_scripts_json,
    scan_options_json = excluded.scan_options_json,
    index_options_json = excluded.index_options_json
"
                ),
                params![
                    job.name.as_str(),
                    job.status.as_str(),
                    job.schedule.as_str(),
                    bool_to_sqlite(job.schedule_enabled),
                    job.keep_last_logs.map(to_i64).transpose()?,
                    job.index_path.as_deref().map(path_to_text),
                    job.previous_index_path.as_deref().map(path_to_text),
                    job.last_index_date.map(to_unix_millis).transpose()?,
                    bool_to_sqlite(job.do_full_scan),
                    to_unix_millis(job.last_modified)?,
                    to_json(&job.user_scripts)?,
                    to_json(&job.scan_options)?,
                    to_json(&job.index_options)?,
                ],
            )?;
            Ok(())
        })
    }

    fn delete_job(&self, name: &str) -> PersistenceResult<bool> {
        self.with_connection("delete_job", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute("DELETE FROM jobs WHERE name = ?1", [name])?;
            Ok(deleted > 0)
        })
    }
}

impl TaskRecordStore for SqliteStore {
    fn insert_task_record(&self, record: &TaskRecord) -> PersistenceResult<()> {
        self.with_connection("insert_task_record", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                &format!(
                    "INSERT INTO task_records ({TASK_RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    record.id.to_string(),
                    record.job.as_str(),
                    record.name.as_str(),
                    to_unix_millis(record.started)?,
                    to_unix_millis(record.ended)?,
                    record.return_code,
                    bool_to_sqlite(record.has_logs),
                ],
            )?;
            Ok(())
        })
    }

    fn task_record(&self, id: TaskId) -> PersistenceResult<Option<TaskRecord>> {
        self.with_connection("task_record", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {TASK_RECORD_COLUMNS} FROM task_records WHERE task_id = ?1"),
                    [id.to_string()],
                    task_record_from_row,
                )
                .optional()
        })
    }

    fn list_task_records(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list_task_records", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {TASK_RECORD_COLUMNS}
FROM task_records
ORDER BY started_unix_ms DESC, rowid DESC
LIMIT ?1
"
            ))?;
            let rows = statement.query_map(params![to_i64(limit)?], task_record_from_row)?;
            rows.collect()
        })
    }

    fn log_records_to_remove(&self, job: &str, keep: usize) -> PersistenceResult<Vec<TaskId>> {
        self.with_connection("log_records_to_remove", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT task_id
FROM task_records
WHERE job_name = ?1 AND has_logs = 1
ORDER BY started_unix_ms DESC, rowid DESC
LIMIT -1 OFFSET ?2
",
            )?;
            let rows = statement.query_map(params![job, to_i64(keep)?], |row| {
                let raw: String = row.get(0)?;
                parse_task_id(&raw)
            })?;
            rows.collect()
        })
    }

    fn clear_has_logs(&self, id: TaskId) -> PersistenceResult<()> {
        self.with_connection("clear_has_logs", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "UPDATE task_records SET has_logs = 0 WHERE task_id = ?1",
                [id.to_string()],
            )?;
            Ok(())
        })
    }
}

impl DefinitionStore for SqliteStore {
    fn user_script(&self, name: &str) -> PersistenceResult<Option<UserScript>> {
        self.load_definition("user_script", "user_scripts", name)
    }

    fn save_user_script(&self, script: &UserScript) -> PersistenceResult<()> {
        self.save_definition("save_user_script", "user_scripts", &script.name, script)
    }

    fn search_backend(&self, name: &str) -> PersistenceResult<Option<SearchBackend>> {
        self.load_definition("search_backend", "search_backends", name)
    }

    fn save_search_backend(&self, backend: &SearchBackend) -> PersistenceResult<()> {
        self.save_definition(
            "save_search_backend",
            "search_backends",
            &backend.name,
            backend,
        )
    }

    fn frontend(&self, name: &str) -> PersistenceResult<Option<Frontend>> {
        self.load_definition("frontend", "frontends", name)
    }

    fn list_frontends(&self) -> PersistenceResult<Vec<Frontend>> {
        self.with_connection("list_frontends", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement =
                connection.prepare("SELECT definition_json FROM frontends ORDER BY name")?;
            let rows = statement.query_map([], |row| {
                let raw: String = row.get(0)?;
                from_json(&raw)
            })?;
            rows.collect()
        })
    }

    fn save_frontend(&self, frontend: &Frontend) -> PersistenceResult<()> {
        self.save_definition("save_frontend", "frontends", &frontend.name, frontend)
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status_raw: String = row.get(1)?;
    let keep_last_logs: Option<i64> = row.get(4)?;
    let index_path: Option<String> = row.get(5)?;
    let previous_index_path: Option<String> = row.get(6)?;
    let last_index_unix_ms: Option<i64> = row.get(7)?;
    let last_modified_unix_ms: i64 = row.get(9)?;
    let user_scripts_json: String = row.get(10)?;
    let scan_options_json: String = row.get(11)?;
    let index_options_json: String = row.get(12)?;

    Ok(Job {
        name: row.get(0)?,
        status: parse_job_status(&status_raw)?,
        schedule: row.get(2)?,
        schedule_enabled: sqlite_to_bool(row.get(3)?),
        keep_last_logs: keep_last_logs.map(to_usize).transpose()?,
        index_path: index_path.map(PathBuf::from),
        previous_index_path: previous_index_path.map(PathBuf::from),
        last_index_date: last_index_unix_ms.map(from_unix_millis).transpose()?,
        do_full_scan: sqlite_to_bool(row.get(8)?),
        last_modified: from_unix_millis(last_modified_unix_ms)?,
        user_scripts: from_json(&user_scripts_json)?,
        scan_options: from_json(&scan_options_json)?,
        index_options: from_json(&index_options_json)?,
    })
}

fn task_record_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let task_id_raw: String = row.get(0)?;
    let started_unix_ms: i64 = row.get(3)?;
    let ended_unix_ms: i64 = row.get(4)?;

    Ok(TaskRecord {
        id: parse_task_id(&task_id_raw)?,
        job: row.get(1)?,
        name: row.get(2)?,
        started: from_unix_millis(started_unix_ms)?,
        ended: from_unix_millis(ended_unix_ms)?,
        return_code: row.get(5)?,
        has_logs: sqlite_to_bool(row.get(6)?),
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before job operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_job_status(raw: &str) -> rusqlite::Result<JobStatus> {
    raw.parse::<JobStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown job status '{raw}' in sqlite record"))
    })
}

fn parse_task_id(raw: &str) -> rusqlite::Result<TaskId> {
    raw.parse::<TaskId>().map_err(|error| {
        storage_error_sqlite(&format!("invalid task id '{raw}' in sqlite record: {error}"))
    })
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| storage_error_sqlite(&format!("failed to encode json column: {error}")))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|error| storage_error_sqlite(&format!("failed to decode json column: {error}")))
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn bool_to_sqlite(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn to_usize(value: i64) -> rusqlite::Result<usize> {
    usize::try_from(value).map_err(|_| storage_error_sqlite("negative count in sqlite record"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
