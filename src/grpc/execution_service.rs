use std::sync::Arc;

use prost::Message;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::catalog::BackendCatalog;
use crate::error::SchedulerError;
use crate::grpc::convert;
use crate::proto::execution_service_server::ExecutionService;
use crate::proto::{
    AssignNextJobRequest, AssignNextJobResponse, ExecutionStatus, Job, JobResultUploadTarget,
    QuantumProgram, RefreshUploadUrlRequest, RefreshUploadUrlResponse,
    ReportExecutionResultRequest, ReportExecutionResultResponse,
};
use crate::scheduler::lifecycle::{ExecutionOutcome, LifecycleCoordinator, WorkerReport};
use crate::scheduler::queue::{JobQueue, QueueEntry};
use crate::store::object::{self, ObjectStoreGateway, UPLOAD_URL_TTL};
use crate::store::record::{JobRecord, JobStatus};

/// Fails a dequeued job if the dispatching RPC dies before the hand-off
/// commits. A dequeued entry is never re-enqueued, so the only safe exit is a
/// terminal record.
struct DispatchGuard {
    coordinator: Arc<LifecycleCoordinator>,
    job_id: String,
    armed: bool,
}

impl DispatchGuard {
    fn new(coordinator: Arc<LifecycleCoordinator>, job_id: String) -> Self {
        Self {
            coordinator,
            job_id,
            armed: true,
        }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if self.armed {
            let coordinator = Arc::clone(&self.coordinator);
            let job_id = std::mem::take(&mut self.job_id);
            tokio::spawn(async move {
                if let Err(e) = coordinator
                    .fail_queued(&job_id, "dispatch interrupted", true)
                    .await
                {
                    tracing::warn!(job_id = %job_id, error = %e, "Dispatch rollback failed");
                }
            });
        }
    }
}

/// Worker-facing gRPC service. Listens on a dedicated port; workers are
/// trusted by network position and carry no token.
pub struct ExecutionServer {
    catalog: Arc<BackendCatalog>,
    coordinator: Arc<LifecycleCoordinator>,
    queue: Arc<JobQueue>,
    objects: Arc<dyn ObjectStoreGateway>,
    shutdown: CancellationToken,
}

impl ExecutionServer {
    pub fn new(
        catalog: Arc<BackendCatalog>,
        coordinator: Arc<LifecycleCoordinator>,
        queue: Arc<JobQueue>,
        objects: Arc<dyn ObjectStoreGateway>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            coordinator,
            queue,
            objects,
            shutdown,
        }
    }

    async fn fetch_program(&self, record: &JobRecord) -> Result<QuantumProgram, SchedulerError> {
        let bytes = match self.objects.get_object(&record.program_ref).await {
            Ok(bytes) => bytes,
            Err(first) => {
                tracing::warn!(job_id = %record.job_id, error = %first, "Retrying program fetch");
                self.objects.get_object(&record.program_ref).await?
            }
        };
        let bytes = bytes.ok_or_else(|| {
            SchedulerError::Internal(format!("program payload missing for job {}", record.job_id))
        })?;
        QuantumProgram::decode(bytes.as_slice()).map_err(|e| {
            SchedulerError::Internal(format!(
                "corrupt program payload for job {}: {e}",
                record.job_id
            ))
        })
    }

    async fn presign_upload(&self, job_id: &str) -> Result<JobResultUploadTarget, SchedulerError> {
        let key = object::result_key(job_id);
        let url = match self.objects.presign_put(&key, UPLOAD_URL_TTL).await {
            Ok(url) => url,
            Err(first) => {
                tracing::warn!(job_id = %job_id, error = %first, "Retrying upload URL");
                self.objects.presign_put(&key, UPLOAD_URL_TTL).await?
            }
        };
        Ok(JobResultUploadTarget {
            upload_url: url.url,
            expires_at: Some(convert::timestamp_to_proto(url.expires_at)),
        })
    }

    /// Dispatch loop: take the next queue entry, validate it against its
    /// record, and hand it to the worker. Entries whose record was cancelled
    /// or became unusable are skipped and the loop continues.
    async fn next_dispatch(
        &self,
        entry: QueueEntry,
    ) -> Result<Option<AssignNextJobResponse>, SchedulerError> {
        let guard = DispatchGuard::new(Arc::clone(&self.coordinator), entry.job_id.clone());

        let record = match self.coordinator.get(&entry.job_id).await {
            Ok(record) => record,
            Err(SchedulerError::NotFound(_)) => {
                tracing::error!(job_id = %entry.job_id, "Queue entry without record, dropping");
                guard.defuse();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if record.status != JobStatus::Queued {
            // Cancelled while queued; the cancel already settled the record.
            guard.defuse();
            return Ok(None);
        }

        let program = match self.fetch_program(&record).await {
            Ok(program) => program,
            Err(e) => {
                tracing::error!(job_id = %entry.job_id, error = %e, "Undeliverable job");
                let _ = self
                    .coordinator
                    .fail_queued(&entry.job_id, "program payload unavailable", true)
                    .await;
                guard.defuse();
                return Ok(None);
            }
        };
        let upload_target = self.presign_upload(&entry.job_id).await?;

        let record = match self.coordinator.mark_running(&entry.job_id).await {
            Ok(record) => record,
            Err(SchedulerError::AlreadyTerminal(_)) => {
                guard.defuse();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let settings = crate::proto::JobExecutionSettings {
            backend: record.backend_requested.clone(),
            n_shots: record.settings.n_shots,
            timeout: Some(convert::duration_to_proto(record.settings.timeout)),
            state_save_policy: convert::save_policy_to_proto(record.settings.state_save_policy)
                as i32,
            resource_squeezing_level: record.settings.resource_squeezing_level,
            role: record.role.as_str().to_string(),
        };

        guard.defuse();
        tracing::info!(job_id = %record.job_id, backend = %record.backend_canonical, "Job dispatched");
        Ok(Some(AssignNextJobResponse {
            job_id: record.job_id,
            job: Some(Job {
                program: Some(program),
                settings: Some(settings),
            }),
            upload_target: Some(upload_target),
        }))
    }
}

#[tonic::async_trait]
impl ExecutionService for ExecutionServer {
    async fn assign_next_job(
        &self,
        request: Request<AssignNextJobRequest>,
    ) -> Result<Response<AssignNextJobResponse>, Status> {
        let req = request.into_inner();
        let resolution = self.catalog.resolve(&req.backend).await?;

        loop {
            let Some(entry) = self.queue.take(&resolution.canonical, &self.shutdown).await else {
                // Shutting down; tell the worker there is nothing to do.
                return Ok(Response::new(AssignNextJobResponse::default()));
            };
            if let Some(response) = self.next_dispatch(entry).await? {
                return Ok(Response::new(response));
            }
        }
    }

    async fn report_execution_result(
        &self,
        request: Request<ReportExecutionResultRequest>,
    ) -> Result<Response<ReportExecutionResultResponse>, Status> {
        let req = request.into_inner();
        let outcome = match req.status() {
            ExecutionStatus::Success => ExecutionOutcome::Success,
            ExecutionStatus::Failure => ExecutionOutcome::Failure,
            ExecutionStatus::Timeout => ExecutionOutcome::Timeout,
            ExecutionStatus::Unspecified => {
                return Err(Status::invalid_argument("execution status is required"));
            }
        };

        let version = req.version.unwrap_or_default();
        let report = WorkerReport {
            outcome,
            detail: req.error_detail,
            timestamps: req
                .timestamps
                .as_ref()
                .map(convert::timestamps_from_proto)
                .unwrap_or_default(),
            actual_backend: (!req.actual_backend.is_empty()).then_some(req.actual_backend),
            physical_lab_version: version.physical_lab_version,
            simulator_version: version.simulator_version,
            result_raw_size_bytes: req.uploaded_result.as_ref().map(|r| r.raw_size_bytes),
            result_encoded_size_bytes: req.uploaded_result.as_ref().map(|r| r.encoded_size_bytes),
        };

        let record = self.coordinator.report(&req.job_id, report).await?;
        tracing::info!(job_id = %req.job_id, status = %record.status, "Execution result recorded");
        Ok(Response::new(ReportExecutionResultResponse {}))
    }

    async fn refresh_upload_url(
        &self,
        request: Request<RefreshUploadUrlRequest>,
    ) -> Result<Response<RefreshUploadUrlResponse>, Status> {
        let req = request.into_inner();
        let record = self.coordinator.get(&req.job_id).await?;
        if record.status != JobStatus::Running {
            return Err(SchedulerError::IllegalTransition(format!(
                "job {} is not running",
                req.job_id
            ))
            .into());
        }

        let upload_target = self.presign_upload(&req.job_id).await?;
        tracing::info!(job_id = %req.job_id, "Upload URL refreshed");
        Ok(Response::new(RefreshUploadUrlResponse {
            upload_target: Some(upload_target),
        }))
    }
}
