use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::catalog::BackendCatalog;
use crate::error::{Result, SchedulerError};
use crate::msglog::MessageLog;
use crate::scheduler::admission::{AdmissionController, AdmissionOutcome};
use crate::scheduler::queue::{EnqueueOutcome, JobQueue, QueueEntry};
use crate::store::object::{self, ObjectStoreGateway};
use crate::store::record::{
    ExecVersion, JobRecord, JobStatus, JobTimestamps, LateReport, RecordStore, RecordStoreError,
};

/// Terminal records are kept this long for post-mortem queries before the
/// external TTL reaper may drop them.
const RECORD_RETENTION_DAYS: i64 = 30;

fn record_retention() -> chrono::Duration {
    chrono::Duration::days(RECORD_RETENTION_DAYS)
}

/// Outcome reported by a worker. Maps onto the terminal job statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Timeout,
}

impl ExecutionOutcome {
    fn job_status(self) -> JobStatus {
        match self {
            ExecutionOutcome::Success => JobStatus::Completed,
            ExecutionOutcome::Failure => JobStatus::Failed,
            ExecutionOutcome::Timeout => JobStatus::Timeout,
        }
    }
}

/// Everything a worker hands back with its result report.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub outcome: ExecutionOutcome,
    pub detail: String,
    pub timestamps: JobTimestamps,
    pub actual_backend: Option<String>,
    pub physical_lab_version: String,
    pub simulator_version: String,
    pub result_raw_size_bytes: Option<u64>,
    pub result_encoded_size_bytes: Option<u64>,
}

enum Step {
    /// Commit this record; release the admission slot if requested.
    Write { record: JobRecord, release: bool },
    /// Nothing to write; the current record already satisfies the caller.
    Done(JobRecord),
}

/// Sole writer of the record store. Every status change funnels through the
/// compare-and-set transition protocol here, which keeps `version` strictly
/// monotonic and admission slots balanced against non-terminal records.
pub struct LifecycleCoordinator {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStoreGateway>,
    admission: Arc<AdmissionController>,
    msglog: Arc<MessageLog>,
}

impl LifecycleCoordinator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStoreGateway>,
        admission: Arc<AdmissionController>,
        msglog: Arc<MessageLog>,
    ) -> Self {
        Self {
            records,
            objects,
            admission,
            msglog,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    async fn get_record(&self, job_id: &str) -> Result<JobRecord> {
        let record = match self.records.get(job_id).await {
            Ok(record) => record,
            Err(RecordStoreError::Unavailable(first)) => {
                tracing::warn!(job_id = %job_id, error = %first, "Retrying record read");
                self.records.get(job_id).await?
            }
            Err(e) => return Err(e.into()),
        };
        record.ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))
    }

    /// Create the initial QUEUED record. `insert` is conditional on absence;
    /// a duplicate id means the id generator is broken, not the caller.
    pub async fn create_queued(&self, record: JobRecord) -> Result<()> {
        debug_assert_eq!(record.status, JobStatus::Queued);
        debug_assert_eq!(record.version, 1);
        match self.records.insert(record.clone()).await {
            Ok(()) => {}
            Err(RecordStoreError::Unavailable(first)) => {
                tracing::warn!(job_id = %record.job_id, error = %first, "Retrying record insert");
                self.records.insert(record.clone()).await?;
            }
            Err(e) => return Err(e.into()),
        }
        self.msglog
            .append(&record.job_id, JobStatus::Queued, "job accepted");
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<JobRecord> {
        self.get_record(job_id).await
    }

    /// Run one transition: read, decide, CAS-write. A CAS miss retries once
    /// from a fresh read; a second miss surfaces CONCURRENT_MODIFICATION.
    async fn run_transition(
        &self,
        job_id: &str,
        decide: impl Fn(&JobRecord) -> Result<Step>,
    ) -> Result<JobRecord> {
        for attempt in 0..2 {
            let current = self.get_record(job_id).await?;
            let previous_status = current.status;

            let (mut next, release) = match decide(&current)? {
                Step::Done(record) => return Ok(record),
                Step::Write { record, release } => (record, release),
            };
            next.version = current.version + 1;

            let write = match self.records.update(next.clone(), current.version).await {
                Err(RecordStoreError::Unavailable(first)) => {
                    tracing::warn!(job_id = %job_id, error = %first, "Retrying record write");
                    self.records.update(next.clone(), current.version).await
                }
                other => other,
            };

            match write {
                Ok(()) => {
                    self.msglog.append(job_id, next.status, next.status_detail.clone());
                    if release && next.status.is_terminal() && !previous_status.is_terminal() {
                        self.admission.release(next.role);
                    }
                    tracing::info!(
                        job_id = %job_id,
                        from = %previous_status,
                        to = %next.status,
                        version = next.version,
                        "Job status updated"
                    );
                    return Ok(next);
                }
                Err(RecordStoreError::VersionConflict { .. }) if attempt == 0 => {
                    tracing::debug!(job_id = %job_id, "CAS miss, re-reading record");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SchedulerError::ConcurrentModification(job_id.to_string()))
    }

    /// QUEUED → RUNNING when a worker picks the job up. A record cancelled
    /// between dequeue and this write surfaces as `AlreadyTerminal` so the
    /// dispatcher can skip it.
    pub async fn mark_running(&self, job_id: &str) -> Result<JobRecord> {
        self.run_transition(job_id, |current| match current.status {
            JobStatus::Queued => {
                let now = Utc::now();
                let mut next = current.clone();
                next.status = JobStatus::Running;
                next.status_detail = "dispatched to worker".to_string();
                next.timestamps.dequeued_at = Some(now);
                next.timestamps.execution_started_at = Some(now);
                Ok(Step::Write {
                    record: next,
                    release: true,
                })
            }
            JobStatus::Cancelled => Err(SchedulerError::AlreadyTerminal(job_id.to_string())),
            other => Err(SchedulerError::IllegalTransition(format!(
                "job {job_id}: {other} -> running"
            ))),
        })
        .await
    }

    /// QUEUED or RUNNING → CANCELLED on user request.
    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord> {
        self.run_transition(job_id, |current| match current.status {
            JobStatus::Queued | JobStatus::Running => {
                let mut next = current.clone();
                next.status = JobStatus::Cancelled;
                next.status_detail = "cancelled by user".to_string();
                next.timestamps.finished_at = Some(Utc::now());
                next.record_expires_at = Some(Utc::now() + record_retention());
                Ok(Step::Write {
                    record: next,
                    release: true,
                })
            }
            _ => Err(SchedulerError::AlreadyTerminal(job_id.to_string())),
        })
        .await
    }

    /// RUNNING → TIMEOUT, driven by the sweeper.
    pub async fn mark_timeout(&self, job_id: &str) -> Result<JobRecord> {
        self.run_transition(job_id, |current| match current.status {
            JobStatus::Running => {
                let mut next = current.clone();
                next.status = JobStatus::Timeout;
                next.status_detail = "execution timed out".to_string();
                next.timestamps.finished_at = Some(Utc::now());
                next.record_expires_at = Some(Utc::now() + record_retention());
                Ok(Step::Write {
                    record: next,
                    release: true,
                })
            }
            other => Err(SchedulerError::IllegalTransition(format!(
                "job {job_id}: {other} -> timeout"
            ))),
        })
        .await
    }

    /// QUEUED → FAILED, used when an admitted job cannot reach a worker
    /// (queue overflow, startup recovery failures). `release` controls whether
    /// an admission slot is currently held for the record.
    pub async fn fail_queued(
        &self,
        job_id: &str,
        detail: &str,
        release: bool,
    ) -> Result<JobRecord> {
        self.run_transition(job_id, |current| match current.status {
            JobStatus::Queued => {
                let mut next = current.clone();
                next.status = JobStatus::Failed;
                next.status_detail = detail.to_string();
                next.timestamps.finished_at = Some(Utc::now());
                next.record_expires_at = Some(Utc::now() + record_retention());
                Ok(Step::Write {
                    record: next,
                    release,
                })
            }
            other => Err(SchedulerError::IllegalTransition(format!(
                "job {job_id}: {other} -> failed"
            ))),
        })
        .await
    }

    fn merge_worker_timestamps(target: &mut JobTimestamps, reported: &JobTimestamps) {
        // The worker owns the compile_* and execution_* events.
        if reported.compile_started_at.is_some() {
            target.compile_started_at = reported.compile_started_at;
        }
        if reported.compile_finished_at.is_some() {
            target.compile_finished_at = reported.compile_finished_at;
        }
        if reported.execution_started_at.is_some() {
            target.execution_started_at = reported.execution_started_at;
        }
        if reported.execution_finished_at.is_some() {
            target.execution_finished_at = reported.execution_finished_at;
        }
    }

    /// Commit a worker's result report.
    ///
    /// RUNNING records move to the mapped terminal status. A record cancelled
    /// mid-flight stays CANCELLED; the report is preserved in `late_report`
    /// and no result pointer is exposed. Duplicate reports that agree with the
    /// committed terminal status are accepted unchanged.
    pub async fn report(&self, job_id: &str, report: WorkerReport) -> Result<JobRecord> {
        let target = report.outcome.job_status();
        let committed = self
            .run_transition(job_id, |current| match current.status {
                JobStatus::Running => {
                    let now = Utc::now();
                    let mut next = current.clone();
                    next.status = target;
                    next.status_detail = report.detail.clone();
                    Self::merge_worker_timestamps(&mut next.timestamps, &report.timestamps);
                    next.timestamps.finished_at = Some(now);
                    next.record_expires_at = Some(now + record_retention());
                    next.actual_backend = report.actual_backend.clone();
                    next.exec_version = ExecVersion {
                        physical_lab: report.physical_lab_version.clone(),
                        scheduler: current.exec_version.scheduler.clone(),
                        simulator: report.simulator_version.clone(),
                    };
                    next.result_raw_size_bytes = report.result_raw_size_bytes;
                    next.result_encoded_size_bytes = report.result_encoded_size_bytes;
                    if report.outcome == ExecutionOutcome::Success {
                        next.result_ref = Some(object::result_key(job_id));
                    }
                    Ok(Step::Write {
                        record: next,
                        release: true,
                    })
                }
                JobStatus::Cancelled => {
                    if current.late_report.is_some() {
                        return Ok(Step::Done(current.clone()));
                    }
                    let mut next = current.clone();
                    Self::merge_worker_timestamps(&mut next.timestamps, &report.timestamps);
                    next.late_report = Some(LateReport {
                        reported_status: target,
                        detail: report.detail.clone(),
                        reported_at: Utc::now(),
                    });
                    // The slot was already released when the cancel committed.
                    Ok(Step::Write {
                        record: next,
                        release: false,
                    })
                }
                status if status == target => Ok(Step::Done(current.clone())),
                other => Err(SchedulerError::IllegalTransition(format!(
                    "job {job_id}: {other} does not accept a {target} report"
                ))),
            })
            .await?;

        if committed.status == JobStatus::Completed {
            self.tag_result(&committed).await;
        }
        Ok(committed)
    }

    /// Best-effort bucket-lifecycle tags on the uploaded result. One retry;
    /// a second failure is logged and the report still succeeds.
    async fn tag_result(&self, record: &JobRecord) {
        let key = object::result_key(&record.job_id);
        let tags = vec![
            ("token_role".to_string(), record.role.as_str().to_string()),
            ("save_job".to_string(), record.save_job.to_string()),
            ("upload-status".to_string(), "complete".to_string()),
        ];
        for attempt in 0..2 {
            match self.objects.tag_object(&key, &tags).await {
                Ok(()) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!(job_id = %record.job_id, error = %e, "Retrying result tagging");
                }
                Err(e) => {
                    tracing::error!(job_id = %record.job_id, error = %e, "Failed to tag job result");
                }
            }
        }
    }

    /// Sweep RUNNING records whose execution exceeded the job's timeout.
    pub async fn sweep_timeouts(&self) {
        let running = match self.records.list_by_status(JobStatus::Running).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Timeout sweep could not list running jobs");
                return;
            }
        };

        let now = Utc::now();
        for record in running {
            let Some(started) = record.timestamps.execution_started_at else {
                continue;
            };
            let timeout = chrono::Duration::from_std(record.settings.timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
            if timeout > chrono::Duration::zero() && started + timeout < now {
                match self.mark_timeout(&record.job_id).await {
                    Ok(_) => {
                        tracing::info!(job_id = %record.job_id, "Job timed out");
                    }
                    // The worker's report or a cancel won the race; fine.
                    Err(SchedulerError::IllegalTransition(_))
                    | Err(SchedulerError::ConcurrentModification(_)) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %record.job_id, error = %e, "Timeout sweep failed");
                    }
                }
            }
        }
    }

    /// Spawn the background timeout sweeper.
    pub fn spawn_timeout_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.sweep_timeouts().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Bring the record store and in-memory state back in line after a
    /// restart: re-admit and re-enqueue QUEUED records, and fail RUNNING
    /// records whose execution was lost with the previous process.
    pub async fn recover(&self, queue: &JobQueue, catalog: &BackendCatalog) -> Result<()> {
        for record in self.records.list_by_status(JobStatus::Running).await? {
            tracing::warn!(job_id = %record.job_id, "Failing job left running by a previous run");
            if let Err(e) = self
                .run_transition(&record.job_id, |current| match current.status {
                    JobStatus::Running => {
                        let mut next = current.clone();
                        next.status = JobStatus::Failed;
                        next.status_detail = "scheduler restarted during execution".to_string();
                        next.timestamps.finished_at = Some(Utc::now());
                        next.record_expires_at = Some(Utc::now() + record_retention());
                        // No slot is held for this record: counters reset at boot.
                        Ok(Step::Write {
                            record: next,
                            release: false,
                        })
                    }
                    _ => Ok(Step::Done(current.clone())),
                })
                .await
            {
                tracing::error!(job_id = %record.job_id, error = %e, "Failed to fail lost job");
            }
        }

        let mut queued = self.records.list_by_status(JobStatus::Queued).await?;
        queued.sort_by_key(|r| r.timestamps.queued_at);
        for record in queued {
            self.restore_queued(record, queue, catalog).await;
        }
        Ok(())
    }

    async fn restore_queued(&self, record: JobRecord, queue: &JobQueue, catalog: &BackendCatalog) {
        let job_id = record.job_id.clone();

        let resolution = match catalog.resolve(&record.backend_requested).await {
            Ok(resolution) => resolution,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Cannot restore job: backend unknown");
                let _ = self
                    .fail_queued(&job_id, "backend no longer served", false)
                    .await;
                return;
            }
        };

        match self.objects.get_object(&record.program_ref).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::error!(job_id = %job_id, "Cannot restore job: program payload missing");
                let _ = self
                    .fail_queued(&job_id, "program payload missing", false)
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Cannot restore job: object store error");
                let _ = self
                    .fail_queued(&job_id, "program payload unavailable", false)
                    .await;
                return;
            }
        }

        match self
            .admission
            .try_reserve(record.role, record.program_size_bytes)
        {
            AdmissionOutcome::Admitted => {}
            _ => {
                tracing::error!(job_id = %job_id, "Cannot restore job: over admission limits");
                let _ = self
                    .fail_queued(&job_id, "restored over admission limits", false)
                    .await;
                return;
            }
        }

        let entry = QueueEntry {
            job_id: job_id.clone(),
            backend: resolution.canonical,
            role: record.role,
            size_bytes: record.program_size_bytes,
            enqueued_at: record.timestamps.queued_at.unwrap_or_else(Utc::now),
        };
        if queue.enqueue(entry) == EnqueueOutcome::RejectedMemory {
            tracing::error!(job_id = %job_id, "Cannot restore job: queue full");
            let _ = self.fail_queued(&job_id, "queue full", true).await;
            return;
        }
        tracing::info!(job_id = %job_id, "Restored queued job");
    }
}
