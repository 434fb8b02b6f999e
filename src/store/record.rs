use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Privilege class carried by a token. Unrecognized roles fall back to the
/// GUEST quota tier so limit lookups are total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Developer,
    Guest,
}

impl Role {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "developer" => Role::Developer,
            _ => Role::Guest,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Developer => "developer",
            Role::Guest => "guest",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateSavePolicy {
    #[default]
    Unspecified,
    All,
    FirstOnly,
    None,
}

/// Execution settings captured from the submit request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    pub n_shots: u32,
    pub timeout: Duration,
    pub state_save_policy: StateSavePolicy,
    pub resource_squeezing_level: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimestamps {
    pub submitted_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub dequeued_at: Option<DateTime<Utc>>,
    pub compile_started_at: Option<DateTime<Utc>>,
    pub compile_finished_at: Option<DateTime<Utc>>,
    pub execution_started_at: Option<DateTime<Utc>>,
    pub execution_finished_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Component versions involved in an execution. The scheduler fills its own
/// slot at submission; the worker supplies the rest with its report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecVersion {
    pub physical_lab: String,
    pub scheduler: String,
    pub simulator: String,
}

/// Post-mortem note kept when a worker reports against a record that was
/// cancelled while the job was running. The terminal status stays CANCELLED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateReport {
    pub reported_status: JobStatus,
    pub detail: String,
    pub reported_at: DateTime<Utc>,
}

/// One durable record per job, keyed by `job_id`. Every write goes through a
/// compare-and-set on `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub token_name: String,
    pub role: Role,
    pub sdk_version: String,

    pub backend_requested: String,
    pub backend_canonical: String,

    pub program_ref: String,
    pub program_size_bytes: u64,
    pub settings: JobSettings,
    pub save_job: bool,

    pub status: JobStatus,
    pub status_detail: String,
    pub result_ref: Option<String>,
    pub version: u64,

    pub timestamps: JobTimestamps,
    pub exec_version: ExecVersion,
    pub actual_backend: Option<String>,
    pub result_raw_size_bytes: Option<u64>,
    pub result_encoded_size_bytes: Option<u64>,
    pub late_report: Option<LateReport>,
    pub record_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record already exists for job {0}")]
    AlreadyExists(String),
    #[error("version conflict on job {job_id}: expected {expected}")]
    VersionConflict { job_id: String, expected: u64 },
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Durable key-value store holding one record per job. Implementations must
/// make `insert` conditional on absence and `update` conditional on the
/// caller-supplied version.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: JobRecord) -> Result<(), RecordStoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, RecordStoreError>;

    /// Replace the stored record iff its current version equals
    /// `expected_version`. `record.version` carries the new version.
    async fn update(&self, record: JobRecord, expected_version: u64)
        -> Result<(), RecordStoreError>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, RecordStoreError>;
}

/// In-memory record store used by tests and `--dev` mode.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, JobRecord>>,
    fail_next: AtomicU32,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn check_fault(&self) -> Result<(), RecordStoreError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(RecordStoreError::Unavailable("injected fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: JobRecord) -> Result<(), RecordStoreError> {
        self.check_fault()?;
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.job_id) {
            return Err(RecordStoreError::AlreadyExists(record.job_id));
        }
        records.insert(record.job_id.clone(), record);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, RecordStoreError> {
        self.check_fault()?;
        Ok(self.records.lock().unwrap().get(job_id).cloned())
    }

    async fn update(
        &self,
        record: JobRecord,
        expected_version: u64,
    ) -> Result<(), RecordStoreError> {
        self.check_fault()?;
        let mut records = self.records.lock().unwrap();
        match records.get(&record.job_id) {
            Some(stored) if stored.version == expected_version => {
                records.insert(record.job_id.clone(), record);
                Ok(())
            }
            Some(_) => Err(RecordStoreError::VersionConflict {
                job_id: record.job_id,
                expected: expected_version,
            }),
            None => Err(RecordStoreError::Unavailable(format!(
                "no record for job {}",
                record.job_id
            ))),
        }
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>, RecordStoreError> {
        self.check_fault()?;
        let records = self.records.lock().unwrap();
        let mut matching: Vec<JobRecord> =
            records.values().filter(|r| r.status == status).cloned().collect();
        matching.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(matching)
    }
}
