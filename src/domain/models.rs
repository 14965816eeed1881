use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::error::IngestionError;

pub const STATUS_BAD_REQUEST: i32 = 400;
pub const STATUS_UNAUTHORIZED: i32 = 401;
pub const STATUS_CONFLICT: i32 = 409;
pub const STATUS_TOO_MANY_REQUESTS: i32 = 429;
pub const STATUS_INTERNAL_ERROR: i32 = 500;
pub const STATUS_UNAVAILABLE: i32 = 503;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionEvent {
    pub bucket: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug)]
pub struct RawContent {
    pub bytes: Vec<u8>,
    pub staged_path: Option<PathBuf>,
}

impl RawContent {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            staged_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    // 1-based
    pub line: usize,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    Direct,
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    Session,
    ConsistentPrefix,
    #[default]
    Eventual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKeyPath {
    raw: String,
    segments: Vec<String>,
}

impl PartitionKeyPath {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Err(format!("partition key path '{raw}' must start with '/'"));
        };

        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(format!("partition key path '{raw}' has an empty segment"));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn lookup<'a>(&self, document: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        self.segments
            .iter()
            .try_fold(document, |value, segment| value.get(segment))
    }
}

impl fmt::Display for PartitionKeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedDocument {
    pub position: usize,
    pub status: i32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportResponse {
    pub imported: u64,
    pub request_units: f64,
    pub rejected: Vec<RejectedDocument>,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentFailure {
    pub index: usize,
    pub line: usize,
    pub status: i32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkImportOutcome {
    pub imported: u64,
    pub request_units: f64,
    pub failures: Vec<DocumentFailure>,
    pub batches: usize,
    pub elapsed: Duration,
}

// Request units are summed from per-batch statistics and may miss charges
// the store did not report.
impl fmt::Display for BulkImportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} imported, ~{:.2} RU (approximate), {} failed, {} batches in {:?}",
            self.imported,
            self.request_units,
            self.failures.len(),
            self.batches,
            self.elapsed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Retrieving,
    Extracting,
    Bootstrapping,
    Importing,
    Reported,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Retrieving => "retrieving",
            Stage::Extracting => "extracting",
            Stage::Bootstrapping => "bootstrapping",
            Stage::Importing => "importing",
            Stage::Reported => "reported",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub object: String,
    pub last_stage: Stage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: Result<BulkImportOutcome, IngestionError>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn outcome(&self) -> Option<&BulkImportOutcome> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&IngestionError> {
        self.result.as_ref().err()
    }
}
