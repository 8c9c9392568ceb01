use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw.trim()).map(TaskId)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Scan,
    Script { script: String },
    Index,
}

impl TaskKind {
    pub fn display_name(&self, job: &str) -> String {
        match self {
            TaskKind::Scan => format!("Scan [{job}]"),
            TaskKind::Script { script } => format!("Script <{script}> [{job}]"),
            TaskKind::Index => format!("Index [{job}]"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "return_code", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed(i32),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    #[serde(default)]
    pub done: u64,
    #[serde(default, alias = "count")]
    pub total: u64,
    #[serde(default)]
    pub index_size: u64,
    #[serde(default, alias = "tn_size")]
    pub store_size: u64,
    #[serde(default)]
    pub waiting: bool,
}

impl TaskProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

/// Durable completion record. Survives eviction of the live task.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub job: String,
    pub name: String,
    pub started: SystemTime,
    pub ended: SystemTime,
    pub return_code: i32,
    pub has_logs: bool,
}

impl TaskRecord {
    pub fn succeeded(&self) -> bool {
        self.return_code == 0
    }
}
