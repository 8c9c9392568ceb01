use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Created,
    Started,
    Indexed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Started => "started",
            JobStatus::Indexed => "indexed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Created, JobStatus::Started)
                | (JobStatus::Started, JobStatus::Indexed)
                | (JobStatus::Started | JobStatus::Indexed, JobStatus::Failed)
                | (JobStatus::Failed | JobStatus::Indexed, JobStatus::Started)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "created" => Ok(JobStatus::Created),
            "started" => Ok(JobStatus::Started),
            "indexed" => Ok(JobStatus::Indexed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveMode {
    Skip,
    List,
    Shallow,
    #[default]
    Recurse,
}

impl ArchiveMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveMode::Skip => "skip",
            ArchiveMode::List => "list",
            ArchiveMode::Shallow => "shallow",
            ArchiveMode::Recurse => "recurse",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub path: PathBuf,
    pub threads: u32,
    pub thumbnail_quality: u32,
    pub thumbnail_size: u32,
    pub thumbnail_count: u32,
    pub content_size: u64,
    pub depth: i32,
    pub archive: ArchiveMode,
    pub archive_passphrase: Option<String>,
    pub ocr_lang: Option<String>,
    pub ocr_images: bool,
    pub ocr_ebooks: bool,
    pub exclude: Option<String>,
    pub fast: bool,
    pub treemap_threshold: f64,
    pub mem_buffer: u32,
    pub read_subtitles: bool,
    pub fast_epub: bool,
    pub checksums: bool,
    pub incremental: bool,
    pub optimize_index: bool,
    pub rewrite_url: Option<String>,
    pub list_file: Option<PathBuf>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/"),
            threads: 1,
            thumbnail_quality: 2,
            thumbnail_size: 552,
            thumbnail_count: 1,
            content_size: 32768,
            depth: -1,
            archive: ArchiveMode::Recurse,
            archive_passphrase: None,
            ocr_lang: None,
            ocr_images: false,
            ocr_ebooks: false,
            exclude: None,
            fast: false,
            treemap_threshold: 0.0005,
            mem_buffer: 2000,
            read_subtitles: false,
            fast_epub: false,
            checksums: false,
            incremental: true,
            optimize_index: false,
            rewrite_url: None,
            list_file: None,
        }
    }
}

impl ScanOptions {
    /// Options whose change invalidates an incremental scan.
    pub const FULL_SCAN_FIELDS: [&'static str; 14] = [
        "path",
        "thumbnail_count",
        "thumbnail_quality",
        "thumbnail_size",
        "content_size",
        "depth",
        "archive",
        "archive_passphrase",
        "ocr_lang",
        "ocr_images",
        "ocr_ebooks",
        "fast",
        "checksums",
        "read_subtitles",
    ];

    pub fn changed_full_scan_fields(&self, other: &ScanOptions) -> Vec<&'static str> {
        let checks = [
            self.path != other.path,
            self.thumbnail_count != other.thumbnail_count,
            self.thumbnail_quality != other.thumbnail_quality,
            self.thumbnail_size != other.thumbnail_size,
            self.content_size != other.content_size,
            self.depth != other.depth,
            self.archive != other.archive,
            self.archive_passphrase != other.archive_passphrase,
            self.ocr_lang != other.ocr_lang,
            self.ocr_images != other.ocr_images,
            self.ocr_ebooks != other.ocr_ebooks,
            self.fast != other.fast,
            self.checksums != other.checksums,
            self.read_subtitles != other.read_subtitles,
        ];

        Self::FULL_SCAN_FIELDS
            .iter()
            .zip(checks)
            .filter_map(|(field, changed)| changed.then_some(*field))
            .collect()
    }

    pub fn args(&self, output: &std::path::Path, name: &str) -> Vec<String> {
        let mut args = vec![
            "scan".to_string(),
            self.path.display().to_string(),
            format!("--threads={}", self.threads),
            format!("--thumbnail-quality={}", self.thumbnail_quality),
            format!("--thumbnail-count={}", self.thumbnail_count),
            format!("--thumbnail-size={}", self.thumbnail_size),
            format!("--content-size={}", self.content_size),
            format!("--output={}", output.display()),
            format!("--depth={}", self.depth),
            format!("--archive={}", self.archive.as_str()),
            format!("--mem-buffer={}", self.mem_buffer),
            format!("--name={name}"),
        ];

        if self.incremental {
            args.push("--incremental".to_string());
        }
        if self.optimize_index {
            args.push("--optimize-index".to_string());
        }
        if let Some(rewrite_url) = non_empty(&self.rewrite_url) {
            args.push(format!("--rewrite-url={rewrite_url}"));
        }
        if let Some(passphrase) = non_empty(&self.archive_passphrase) {
            args.push(format!("--archive-passphrase={passphrase}"));
        }
        if let Some(ocr_lang) = non_empty(&self.ocr_lang) {
            args.push(format!("--ocr-lang={ocr_lang}"));
        }
        if self.ocr_ebooks {
            args.push("--ocr-ebooks".to_string());
        }
        if self.ocr_images {
            args.push("--ocr-images".to_string());
        }
        if let Some(exclude) = non_empty(&self.exclude) {
            args.push(format!("--exclude={exclude}"));
        }
        if self.fast {
            args.push("--fast".to_string());
        }
        if self.treemap_threshold > 0.0 {
            args.push(format!("--treemap-threshold={}", self.treemap_threshold));
        }
        if self.read_subtitles {
            args.push("--read-subtitles".to_string());
        }
        if self.fast_epub {
            args.push("--fast-epub".to_string());
        }
        if self.checksums {
            args.push("--checksums".to_string());
        }
        if let Some(list_file) = &self.list_file {
            args.push(format!("--list-file={}", list_file.display()));
        }

        args
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    pub search_backend: String,
    pub threads: u32,
    pub incremental: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            search_backend: "default".to_string(),
            threads: 1,
            incremental: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub scan_options: ScanOptions,
    pub index_options: IndexOptions,
    #[serde(default)]
    pub user_scripts: Vec<String>,
    pub schedule: String,
    #[serde(default)]
    pub schedule_enabled: bool,
    /// `None` keeps every task log.
    #[serde(default)]
    pub keep_last_logs: Option<usize>,
    #[serde(default)]
    pub index_path: Option<PathBuf>,
    #[serde(default)]
    pub previous_index_path: Option<PathBuf>,
    #[serde(default)]
    pub last_index_date: Option<SystemTime>,
    #[serde(default)]
    pub status: JobStatus,
    pub last_modified: SystemTime,
    #[serde(default)]
    pub do_full_scan: bool,
}

impl Job {
    pub fn new_default(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scan_options: ScanOptions::default(),
            index_options: IndexOptions::default(),
            user_scripts: Vec::new(),
            schedule: "0 0 * * *".to_string(),
            schedule_enabled: false,
            keep_last_logs: None,
            index_path: None,
            previous_index_path: None,
            last_index_date: None,
            status: JobStatus::Created,
            last_modified: SystemTime::now(),
            do_full_scan: false,
        }
    }

    pub fn transition_status(&mut self, next: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!(
                    "illegal job status transition '{}' -> '{}'",
                    self.status, next
                ),
            )
            .for_job(self.name.clone()));
        }
        self.status = next;
        Ok(())
    }

    /// Moves the job into `started` for a new run. A job that is already
    /// started stays there.
    pub fn mark_run_submitted(&mut self) -> Result<(), CoreError> {
        if self.status == JobStatus::Started {
            return Ok(());
        }
        self.transition_status(JobStatus::Started)
    }

    /// Replaces the user-editable configuration with `update`, keeping run
    /// state. Changing any scan option that affects already-indexed content
    /// forces the next run to rescan from scratch.
    pub fn apply_update(&mut self, update: Job) -> Vec<&'static str> {
        let changed = self.scan_options.changed_full_scan_fields(&update.scan_options);
        if !changed.is_empty() {
            self.do_full_scan = true;
        }

        self.scan_options = update.scan_options;
        self.index_options = update.index_options;
        self.user_scripts = update.user_scripts;
        self.schedule = update.schedule;
        self.schedule_enabled = update.schedule_enabled;
        self.keep_last_logs = update.keep_last_logs;
        self.last_modified = SystemTime::now();

        changed
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}
