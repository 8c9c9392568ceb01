#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_job_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS jobs (
    name TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    schedule TEXT NOT NULL,
    schedule_enabled INTEGER NOT NULL DEFAULT 0,
    keep_last_logs INTEGER,
    index_path TEXT,
    previous_index_path TEXT,
    last_index_unix_ms INTEGER,
    do_full_scan INTEGER NOT NULL DEFAULT 0,
    last_modified_unix_ms INTEGER NOT NULL,
    user_scripts_json TEXT NOT NULL,
    scan_options_json TEXT NOT NULL,
    index_options_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_records (
    task_id TEXT PRIMARY KEY,
    job_name TEXT NOT NULL,
    name TEXT NOT NULL,
    started_unix_ms INTEGER NOT NULL,
    ended_unix_ms INTEGER NOT NULL,
    return_code INTEGER NOT NULL,
    has_logs INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_task_records_started
    ON task_records (started_unix_ms DESC);

CREATE INDEX IF NOT EXISTS idx_task_records_job_logs
    ON task_records (job_name, has_logs);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_records_job_logs;
DROP INDEX IF EXISTS idx_task_records_started;
DROP TABLE IF EXISTS task_records;
DROP TABLE IF EXISTS jobs;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_scripts_backends_and_frontends",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS user_scripts (
    name TEXT PRIMARY KEY,
    definition_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS search_backends (
    name TEXT PRIMARY KEY,
    definition_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS frontends (
    name TEXT PRIMARY KEY,
    definition_json TEXT NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS frontends;
DROP TABLE IF EXISTS search_backends;
DROP TABLE IF EXISTS user_scripts;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
