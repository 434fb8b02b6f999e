use std::sync::Arc;

use chrono::Utc;
use prost::Message;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::catalog::BackendCatalog;
use crate::error::SchedulerError;
use crate::grpc::convert;
use crate::proto::submission_service_server::SubmissionService;
use crate::proto::{
    CancelJobRequest, CancelJobResponse, GetJobResultRequest, GetJobResultResponse,
    GetJobStatusRequest, GetJobStatusResponse, GetServiceStatusRequest, GetServiceStatusResponse,
    JobResult, SubmitJobRequest, SubmitJobResponse,
};
use crate::scheduler::admission::{AdmissionController, AdmissionOutcome};
use crate::scheduler::lifecycle::LifecycleCoordinator;
use crate::scheduler::queue::{EnqueueOutcome, JobQueue, QueueEntry};
use crate::store::object::{self, ObjectStoreGateway, DOWNLOAD_URL_TTL};
use crate::store::record::{ExecVersion, JobRecord, JobSettings, JobStatus, JobTimestamps};
use crate::token::{TokenInfo, TokenResolver};
use crate::SCHEDULER_VERSION;

/// Releases an admission slot unless the submission commits.
struct AdmissionGuard {
    admission: Arc<AdmissionController>,
    role: crate::store::record::Role,
    armed: bool,
}

impl AdmissionGuard {
    fn new(admission: Arc<AdmissionController>, role: crate::store::record::Role) -> Self {
        Self {
            admission,
            role,
            armed: true,
        }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.admission.release(self.role);
        }
    }
}

/// Deletes an uploaded program unless the submission commits. Cleanup is
/// best-effort; the drop path covers RPC cancellation mid-submission.
struct UploadGuard {
    objects: Arc<dyn ObjectStoreGateway>,
    key: String,
    armed: bool,
}

impl UploadGuard {
    fn new(objects: Arc<dyn ObjectStoreGateway>, key: String) -> Self {
        Self {
            objects,
            key,
            armed: true,
        }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        if self.armed {
            let objects = Arc::clone(&self.objects);
            let key = std::mem::take(&mut self.key);
            tokio::spawn(async move {
                if let Err(e) = objects.delete_object(&key).await {
                    tracing::warn!(key = %key, error = %e, "Failed to clean up orphaned upload");
                }
            });
        }
    }
}

/// User-facing gRPC service: submission, cancellation, and status queries.
pub struct SubmissionServer {
    tokens: Arc<dyn TokenResolver>,
    catalog: Arc<BackendCatalog>,
    coordinator: Arc<LifecycleCoordinator>,
    admission: Arc<AdmissionController>,
    queue: Arc<JobQueue>,
    objects: Arc<dyn ObjectStoreGateway>,
}

impl SubmissionServer {
    pub fn new(
        tokens: Arc<dyn TokenResolver>,
        catalog: Arc<BackendCatalog>,
        coordinator: Arc<LifecycleCoordinator>,
        admission: Arc<AdmissionController>,
        queue: Arc<JobQueue>,
        objects: Arc<dyn ObjectStoreGateway>,
    ) -> Self {
        Self {
            tokens,
            catalog,
            coordinator,
            admission,
            queue,
            objects,
        }
    }

    /// Resolve the caller's token. Tokens are never cached and never logged.
    async fn authenticate(&self, token: &str) -> Result<TokenInfo, SchedulerError> {
        if token.is_empty() {
            return Err(SchedulerError::Unauthenticated("token is empty".into()));
        }
        let resolved = match self.tokens.resolve(token).await {
            Ok(resolved) => resolved,
            Err(first) => {
                tracing::warn!(error = %first, "Retrying token lookup");
                self.tokens.resolve(token).await?
            }
        };
        let info = resolved
            .ok_or_else(|| SchedulerError::Unauthenticated("token not found".into()))?;
        if info.is_expired(Utc::now()) {
            return Err(SchedulerError::Unauthenticated("token expired".into()));
        }
        Ok(info)
    }

    async fn owned_record(
        &self,
        info: &TokenInfo,
        job_id: &str,
    ) -> Result<JobRecord, SchedulerError> {
        let record = self.coordinator.get(job_id).await?;
        if record.token_name != info.name {
            return Err(SchedulerError::Unauthorized(job_id.to_string()));
        }
        Ok(record)
    }

    async fn put_program(&self, key: &str, bytes: Vec<u8>) -> Result<(), SchedulerError> {
        if let Err(first) = self.objects.put_object(key, bytes.clone()).await {
            tracing::warn!(key = %key, error = %first, "Retrying program upload");
            self.objects.put_object(key, bytes).await?;
        }
        Ok(())
    }

    async fn handle_submit(&self, req: SubmitJobRequest) -> Result<String, Status> {
        let info = self.authenticate(&req.token).await?;

        let job = req
            .job
            .ok_or_else(|| Status::invalid_argument("job is required"))?;
        let settings = job
            .settings
            .ok_or_else(|| Status::invalid_argument("job settings are required"))?;
        let program = job
            .program
            .ok_or_else(|| Status::invalid_argument("job program is required"))?;

        let resolution = self.catalog.resolve(&settings.backend).await?;
        if !resolution.is_dispatch_eligible() {
            return Err(SchedulerError::BackendUnavailable(settings.backend).into());
        }

        let program_bytes = program.encode_to_vec();
        let size = program_bytes.len() as u64;

        match self.admission.try_reserve(info.role, size) {
            AdmissionOutcome::Admitted => {}
            AdmissionOutcome::QuotaExceeded => {
                return Err(SchedulerError::QuotaExceeded(info.role).into());
            }
            AdmissionOutcome::PayloadTooLarge { limit } => {
                return Err(SchedulerError::PayloadTooLarge {
                    role: info.role,
                    size,
                    limit,
                }
                .into());
            }
        }
        let admission_guard = AdmissionGuard::new(Arc::clone(&self.admission), info.role);

        let job_id = Uuid::now_v7().to_string();
        let program_ref = object::program_key(&job_id);
        self.put_program(&program_ref, program_bytes).await?;
        let upload_guard = UploadGuard::new(Arc::clone(&self.objects), program_ref.clone());

        let now = Utc::now();
        let state_save_policy = settings.state_save_policy();
        let record = JobRecord {
            job_id: job_id.clone(),
            token_name: info.name.clone(),
            role: info.role,
            sdk_version: req.sdk_version,
            backend_requested: settings.backend.clone(),
            backend_canonical: resolution.canonical.clone(),
            program_ref,
            program_size_bytes: size,
            settings: JobSettings {
                n_shots: settings.n_shots,
                timeout: settings
                    .timeout
                    .as_ref()
                    .map(convert::duration_from_proto)
                    .unwrap_or_default(),
                state_save_policy: convert::save_policy_from_proto(state_save_policy),
                resource_squeezing_level: settings.resource_squeezing_level,
            },
            save_job: req.options.map(|o| o.save_job).unwrap_or(false),
            status: JobStatus::Queued,
            status_detail: String::new(),
            result_ref: None,
            version: 1,
            timestamps: JobTimestamps {
                submitted_at: Some(now),
                queued_at: Some(now),
                ..Default::default()
            },
            exec_version: ExecVersion {
                scheduler: SCHEDULER_VERSION.to_string(),
                ..Default::default()
            },
            actual_backend: None,
            result_raw_size_bytes: None,
            result_encoded_size_bytes: None,
            late_report: None,
            record_expires_at: None,
        };
        self.coordinator.create_queued(record).await?;

        let entry = QueueEntry {
            job_id: job_id.clone(),
            backend: resolution.canonical,
            role: info.role,
            size_bytes: size,
            enqueued_at: now,
        };
        if self.queue.enqueue(entry) == EnqueueOutcome::RejectedMemory {
            // The record stays as the audit trail of the rejection; the
            // guards roll back the slot and the uploaded program.
            if let Err(e) = self.coordinator.fail_queued(&job_id, "queue full", false).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record queue overflow");
            }
            return Err(SchedulerError::ResourceExhausted.into());
        }

        admission_guard.defuse();
        upload_guard.defuse();
        tracing::info!(job_id = %job_id, backend = %settings.backend, role = %info.role, "Job submitted");
        Ok(job_id)
    }
}

#[tonic::async_trait]
impl SubmissionService for SubmissionServer {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let job_id = self.handle_submit(request.into_inner()).await?;
        Ok(Response::new(SubmitJobResponse { job_id }))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let req = request.into_inner();
        let info = self.authenticate(&req.token).await?;
        let record = self.owned_record(&info, &req.job_id).await?;

        match record.status {
            JobStatus::Queued => {
                // Remove from the queue first so no worker can win the race
                // after the cancel commits.
                self.queue.remove(&req.job_id);
                self.coordinator.cancel(&req.job_id).await?;
            }
            JobStatus::Running => {
                self.coordinator.cancel(&req.job_id).await?;
            }
            _ => return Err(SchedulerError::AlreadyTerminal(req.job_id).into()),
        }

        tracing::info!(job_id = %req.job_id, "Job cancelled");
        Ok(Response::new(CancelJobResponse {}))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let req = request.into_inner();
        let info = self.authenticate(&req.token).await?;
        let record = self.owned_record(&info, &req.job_id).await?;

        Ok(Response::new(GetJobStatusResponse {
            status: convert::status_to_proto(record.status) as i32,
            status_detail: record.status_detail.clone(),
            execution_details: Some(convert::execution_details(&record)),
        }))
    }

    async fn get_job_result(
        &self,
        request: Request<GetJobResultRequest>,
    ) -> Result<Response<GetJobResultResponse>, Status> {
        let req = request.into_inner();
        let info = self.authenticate(&req.token).await?;
        let record = self.owned_record(&info, &req.job_id).await?;

        // Only COMPLETED jobs expose a result; a cancelled job's late upload
        // stays private to the post-mortem record.
        let result = match (&record.status, &record.result_ref) {
            (JobStatus::Completed, Some(result_ref)) => {
                let url = match self.objects.presign_get(result_ref, DOWNLOAD_URL_TTL).await {
                    Ok(url) => url,
                    Err(first) => {
                        tracing::warn!(job_id = %req.job_id, error = %first, "Retrying result URL");
                        self.objects
                            .presign_get(result_ref, DOWNLOAD_URL_TTL)
                            .await
                            .map_err(SchedulerError::from)?
                    }
                };
                Some(JobResult {
                    result_url: url.url,
                    url_expires_at: Some(convert::timestamp_to_proto(url.expires_at)),
                })
            }
            _ => None,
        };

        Ok(Response::new(GetJobResultResponse {
            status: convert::status_to_proto(record.status) as i32,
            status_detail: record.status_detail.clone(),
            execution_details: Some(convert::execution_details(&record)),
            result,
        }))
    }

    async fn get_service_status(
        &self,
        request: Request<GetServiceStatusRequest>,
    ) -> Result<Response<GetServiceStatusResponse>, Status> {
        let req = request.into_inner();
        self.authenticate(&req.token).await?;
        let resolution = self.catalog.resolve(&req.backend).await?;

        Ok(Response::new(GetServiceStatusResponse {
            status: convert::backend_status_to_proto(resolution.status) as i32,
            description: resolution.description,
        }))
    }
}
