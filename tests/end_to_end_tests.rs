//! Full submit → dispatch → report flows across both service surfaces.


use std::sync::Arc;
use std::time::Duration;

use tonic::Request;

use qcloud_scheduler::proto::execution_service_server::ExecutionService;
use qcloud_scheduler::proto::submission_service_server::SubmissionService;
use qcloud_scheduler::proto::{
    AssignNextJobRequest, ExecutionStatus, GetJobResultRequest, GetJobStatusRequest,
    JobExecutionVersion, JobStatus as ProtoJobStatus, JobTimestamps, ReportExecutionResultRequest,
    UploadedResult,
};
use qcloud_scheduler::store::record::Role;
use test_harness::{default_stack, submit_request, TestStack, MIB};

async fn job_status(stack: &TestStack, token: &str, job_id: &str) -> ProtoJobStatus {
    stack
        .submission
        .get_job_status(Request::new(GetJobStatusRequest {
            token: token.to_string(),
            job_id: job_id.to_string(),
        }))
        .await
        .unwrap()
        .into_inner()
        .status()
}

#[tokio::test]
async fn happy_path_from_submission_to_result_download() {
    let stack = default_stack();
    let payload = vec![42u8; MIB as usize];

    // Submit as a developer against the live backend.
    let job_id = stack
        .submission
        .submit_job(Request::new(submit_request("alice-token", "qpu", payload.clone())))
        .await
        .unwrap()
        .into_inner()
        .job_id;
    assert_eq!(job_status(&stack, "alice-token", &job_id).await, ProtoJobStatus::Queued);

    // A worker polls and receives the job plus an upload capability.
    let assigned = stack
        .execution
        .assign_next_job(Request::new(AssignNextJobRequest {
            backend: "qpu".into(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(assigned.job_id, job_id);
    assert_eq!(assigned.job.unwrap().program.unwrap().payload, payload);
    let upload = assigned.upload_target.unwrap();
    assert!(!upload.upload_url.is_empty());
    assert_eq!(job_status(&stack, "alice-token", &job_id).await, ProtoJobStatus::Running);

    // The worker uploads out-of-band and reports success.
    stack
        .execution
        .report_execution_result(Request::new(ReportExecutionResultRequest {
            job_id: job_id.clone(),
            status: ExecutionStatus::Success as i32,
            uploaded_result: Some(UploadedResult {
                raw_size_bytes: 4096,
                encoded_size_bytes: 1024,
            }),
            timestamps: Some(JobTimestamps::default()),
            version: Some(JobExecutionVersion {
                physical_lab_version: "lab-7.2".into(),
                ..Default::default()
            }),
            ..Default::default()
        }))
        .await
        .unwrap();
    assert_eq!(
        job_status(&stack, "alice-token", &job_id).await,
        ProtoJobStatus::Completed
    );

    // The user fetches a time-limited download URL.
    let result = stack
        .submission
        .get_job_result(Request::new(GetJobResultRequest {
            token: "alice-token".into(),
            job_id: job_id.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    let job_result = result.result.unwrap();
    assert!(job_result.result_url.contains(&format!("jobs/{job_id}/result")));
    assert!(job_result.url_expires_at.is_some());

    // Everything settled: no slots held, queue drained.
    assert_eq!(stack.admission.active_jobs(Role::Developer), 0);
    assert_eq!(stack.queue.len("qpu"), 0);
}

#[tokio::test]
async fn pipelined_jobs_flow_through_in_submission_order() {
    let stack = Arc::new(default_stack());

    // A worker waits before anything is submitted.
    let worker = {
        let stack = stack.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let assigned = stack
                    .execution
                    .assign_next_job(Request::new(AssignNextJobRequest {
                        backend: "qpu".into(),
                    }))
                    .await
                    .unwrap()
                    .into_inner();
                stack
                    .execution
                    .report_execution_result(Request::new(ReportExecutionResultRequest {
                        job_id: assigned.job_id.clone(),
                        status: ExecutionStatus::Success as i32,
                        version: Some(JobExecutionVersion::default()),
                        ..Default::default()
                    }))
                    .await
                    .unwrap();
                seen.push(assigned.job_id);
            }
            seen
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut submitted = Vec::new();
    for i in 0..3u8 {
        let job_id = stack
            .submission
            .submit_job(Request::new(submit_request("alice-token", "qpu", vec![i; 32])))
            .await
            .unwrap()
            .into_inner()
            .job_id;
        submitted.push(job_id);
    }

    let seen = worker.await.unwrap();
    assert_eq!(seen, submitted);

    for job_id in &submitted {
        assert_eq!(
            job_status(&stack, "alice-token", job_id).await,
            ProtoJobStatus::Completed
        );
    }
    assert_eq!(stack.admission.active_jobs(Role::Developer), 0);
}
