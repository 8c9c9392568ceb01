use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserScript {
    pub name: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: String,
}

impl UserScript {
    pub fn split_extra_args(&self) -> Result<Vec<String>, CoreError> {
        shlex::split(&self.extra_args).ok_or_else(|| {
            CoreError::new(
                CoreErrorKind::ParseFailure,
                format!(
                    "extra arguments of script '{}' have unbalanced quoting",
                    self.name
                ),
            )
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchBackendKind {
    Elasticsearch {
        es_url: String,
        es_index: String,
        #[serde(default)]
        es_insecure_ssl: bool,
        #[serde(default = "default_batch_size")]
        batch_size: u32,
    },
    Sqlite {
        search_index: PathBuf,
    },
}

fn default_batch_size() -> u32 {
    70
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SearchBackend {
    pub name: String,
    #[serde(flatten)]
    pub kind: SearchBackendKind,
}

impl SearchBackend {
    pub fn elasticsearch(name: impl Into<String>, es_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SearchBackendKind::Elasticsearch {
                es_url: es_url.into(),
                es_index: "conductor".to_string(),
                es_insecure_ssl: false,
                batch_size: default_batch_size(),
            },
        }
    }

    pub fn sqlite(name: impl Into<String>, search_index: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: SearchBackendKind::Sqlite {
                search_index: search_index.into(),
            },
        }
    }

    pub fn index_args(&self, index_path: &Path, threads: u32, incremental: bool) -> Vec<String> {
        let mut args = match &self.kind {
            SearchBackendKind::Elasticsearch {
                es_url,
                es_index,
                es_insecure_ssl,
                batch_size,
            } => {
                let mut args = vec![
                    "index".to_string(),
                    index_path.display().to_string(),
                    format!("--threads={threads}"),
                    format!("--es-url={es_url}"),
                    format!("--es-index={es_index}"),
                    format!("--batch-size={batch_size}"),
                ];
                if *es_insecure_ssl {
                    args.push("--es-insecure-ssl".to_string());
                }
                args
            }
            SearchBackendKind::Sqlite { search_index } => vec![
                "sqlite-index".to_string(),
                index_path.display().to_string(),
                format!("--search-index={}", search_index.display()),
            ],
        };

        if incremental {
            args.push("--incremental-index".to_string());
        }
        args
    }

    pub fn web_args(&self) -> Vec<String> {
        match &self.kind {
            SearchBackendKind::Elasticsearch {
                es_url,
                es_index,
                es_insecure_ssl,
                ..
            } => {
                let mut args = vec![
                    format!("--es-url={es_url}"),
                    format!("--es-index={es_index}"),
                ];
                if *es_insecure_ssl {
                    args.push("--es-insecure-ssl".to_string());
                }
                args
            }
            SearchBackendKind::Sqlite { search_index } => {
                vec![format!("--search-index={}", search_index.display())]
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Frontend {
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<String>,
    pub search_backend: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_bind() -> String {
    "0.0.0.0:4090".to_string()
}

impl Frontend {
    pub fn new(name: impl Into<String>, search_backend: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Vec::new(),
            search_backend: search_backend.into(),
            bind: default_bind(),
            auto_start: false,
            extra_args: Vec::new(),
        }
    }

    pub fn depends_on_job(&self, job: &str) -> bool {
        self.jobs.iter().any(|name| name == job)
    }

    pub fn web_args(&self, backend: &SearchBackend, indices: &[PathBuf]) -> Vec<String> {
        let mut args = vec!["web".to_string()];
        args.extend(backend.web_args());
        args.push(format!("--bind={}", self.bind));
        args.extend(self.extra_args.iter().cloned());
        args.extend(indices.iter().map(|path| path.display().to_string()));
        args
    }
}
