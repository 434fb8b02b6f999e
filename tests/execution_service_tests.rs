
use std::sync::Arc;
use std::time::Duration;

use tonic::{Code, Request};

use qcloud_scheduler::proto::execution_service_server::ExecutionService;
use qcloud_scheduler::proto::submission_service_server::SubmissionService;
use qcloud_scheduler::proto::{
    AssignNextJobRequest, CancelJobRequest, ExecutionStatus, GetJobResultRequest,
    JobExecutionVersion, JobTimestamps, RefreshUploadUrlRequest, ReportExecutionResultRequest,
    UploadedResult,
};
use qcloud_scheduler::store::record::{JobStatus, Role};
use test_harness::{build_stack, default_stack, submit_request, StackOptions, TestStack};

async fn submit(stack: &TestStack, token: &str, backend: &str, payload: Vec<u8>) -> String {
    stack
        .submission
        .submit_job(Request::new(submit_request(token, backend, payload)))
        .await
        .unwrap()
        .into_inner()
        .job_id
}

async fn assign(stack: &TestStack, backend: &str) -> qcloud_scheduler::proto::AssignNextJobResponse {
    stack
        .execution
        .assign_next_job(Request::new(AssignNextJobRequest {
            backend: backend.to_string(),
        }))
        .await
        .unwrap()
        .into_inner()
}

fn success_report(job_id: &str) -> ReportExecutionResultRequest {
    ReportExecutionResultRequest {
        job_id: job_id.to_string(),
        status: ExecutionStatus::Success as i32,
        error_detail: String::new(),
        uploaded_result: Some(UploadedResult {
            raw_size_bytes: 2048,
            encoded_size_bytes: 512,
        }),
        timestamps: Some(JobTimestamps {
            compile_started_at: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
            compile_finished_at: Some(prost_types::Timestamp {
                seconds: 1_700_000_001,
                nanos: 0,
            }),
            execution_started_at: Some(prost_types::Timestamp {
                seconds: 1_700_000_002,
                nanos: 0,
            }),
            execution_finished_at: Some(prost_types::Timestamp {
                seconds: 1_700_000_005,
                nanos: 0,
            }),
            ..Default::default()
        }),
        actual_backend: "qpu-rack-2".into(),
        version: Some(JobExecutionVersion {
            physical_lab_version: "lab-7.2".into(),
            scheduler_version: String::new(),
            simulator_version: "sim-1.4".into(),
        }),
    }
}

#[tokio::test]
async fn assign_returns_the_submitted_program_and_settings() {
    let stack = default_stack();
    let payload = vec![7u8; 256];
    let job_id = submit(&stack, "alice-token", "qpu", payload.clone()).await;

    let assigned = assign(&stack, "qpu").await;
    assert_eq!(assigned.job_id, job_id);

    // The worker sees exactly what the user submitted.
    let job = assigned.job.unwrap();
    assert_eq!(job.program.unwrap().payload, payload);
    let settings = job.settings.unwrap();
    assert_eq!(settings.backend, "qpu");
    assert_eq!(settings.n_shots, 1000);
    assert_eq!(settings.role, "developer");

    let upload = assigned.upload_target.unwrap();
    assert!(upload.upload_url.contains(&format!("jobs/{job_id}/result")));
    assert!(upload.expires_at.is_some());

    let record = stack.coordinator.get(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Running);
    assert!(record.timestamps.dequeued_at.is_some());
    assert!(record.timestamps.execution_started_at.is_some());
    assert_eq!(record.version, 2);
}

#[tokio::test]
async fn assign_blocks_until_a_job_arrives() {
    let stack = Arc::new(default_stack());

    let waiter = {
        let stack = stack.clone();
        tokio::spawn(async move { assign(&stack, "qpu").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    let job_id = submit(&stack, "alice-token", "qpu", vec![1; 64]).await;
    let assigned = waiter.await.unwrap();
    assert_eq!(assigned.job_id, job_id);
}

#[tokio::test]
async fn assign_for_unknown_backend_is_rejected() {
    let stack = default_stack();
    let err = stack
        .execution
        .assign_next_job(Request::new(AssignNextJobRequest {
            backend: "gpu".into(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn cancelled_job_is_never_dispatched() {
    let stack = Arc::new(default_stack());
    let job_id = submit(&stack, "alice-token", "qpu", vec![1; 64]).await;

    stack
        .submission
        .cancel_job(Request::new(CancelJobRequest {
            token: "alice-token".into(),
            job_id: job_id.clone(),
        }))
        .await
        .unwrap();

    // The queue is empty, so the dispatcher blocks until shutdown and then
    // reports no work.
    let waiter = {
        let stack = stack.clone();
        tokio::spawn(async move { assign(&stack, "qpu").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    stack.shutdown.cancel();
    let assigned = waiter.await.unwrap();
    assert!(assigned.job_id.is_empty());

    let record = stack.coordinator.get(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn stale_queue_entry_for_a_cancelled_record_is_skipped() {
    let stack = Arc::new(default_stack());
    let job_id = submit(&stack, "alice-token", "qpu", vec![1; 64]).await;

    // Cancel the record while leaving the queue entry in place, simulating a
    // cancel racing the dispatcher.
    stack.coordinator.cancel(&job_id).await.unwrap();
    assert_eq!(stack.queue.len("qpu"), 1);

    let waiter = {
        let stack = stack.clone();
        tokio::spawn(async move { assign(&stack, "qpu").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    stack.shutdown.cancel();
    let assigned = waiter.await.unwrap();
    assert!(assigned.job_id.is_empty());

    let record = stack.coordinator.get(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn successful_report_completes_the_job() {
    let stack = default_stack();
    let job_id = submit(&stack, "alice-token", "qpu", vec![1; 64]).await;
    assign(&stack, "qpu").await;

    stack
        .execution
        .report_execution_result(Request::new(success_report(&job_id)))
        .await
        .unwrap();

    let record = stack.coordinator.get(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.result_ref.as_deref(), Some(format!("jobs/{job_id}/result").as_str()));
    assert_eq!(record.actual_backend.as_deref(), Some("qpu-rack-2"));
    assert_eq!(record.exec_version.physical_lab, "lab-7.2");
    assert_eq!(record.exec_version.simulator, "sim-1.4");
    assert_eq!(record.exec_version.scheduler, qcloud_scheduler::SCHEDULER_VERSION);
    assert_eq!(record.result_raw_size_bytes, Some(2048));
    assert!(record.timestamps.finished_at.is_some());
    // Worker timestamps win over the dispatch-time stamps.
    assert_eq!(
        record.timestamps.execution_started_at.unwrap().timestamp(),
        1_700_000_002
    );

    // The slot is released and the result carries lifecycle tags.
    assert_eq!(stack.admission.active_jobs(Role::Developer), 0);
    let tags = stack.objects.tags_for(&format!("jobs/{job_id}/result"));
    assert!(tags.contains(&("save_job".to_string(), "true".to_string())));
    assert!(tags.contains(&("upload-status".to_string(), "complete".to_string())));
}

#[tokio::test]
async fn duplicate_report_is_idempotent() {
    let stack = default_stack();
    let job_id = submit(&stack, "alice-token", "qpu", vec![1; 64]).await;
    assign(&stack, "qpu").await;

    stack
        .execution
        .report_execution_result(Request::new(success_report(&job_id)))
        .await
        .unwrap();
    let first = stack.coordinator.get(&job_id).await.unwrap();

    stack
        .execution
        .report_execution_result(Request::new(success_report(&job_id)))
        .await
        .unwrap();
    let second = stack.coordinator.get(&job_id).await.unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.timestamps.finished_at, second.timestamps.finished_at);
    assert_eq!(first.version, second.version);
    // The slot is not released twice.
    assert_eq!(stack.admission.active_jobs(Role::Developer), 0);
}

#[tokio::test]
async fn conflicting_report_is_rejected() {
    let stack = default_stack();
    let job_id = submit(&stack, "alice-token", "qpu", vec![1; 64]).await;
    assign(&stack, "qpu").await;

    stack
        .execution
        .report_execution_result(Request::new(success_report(&job_id)))
        .await
        .unwrap();

    let mut conflicting = success_report(&job_id);
    conflicting.status = ExecutionStatus::Failure as i32;
    let err = stack
        .execution
        .report_execution_result(Request::new(conflicting))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn report_with_unspecified_status_is_rejected() {
    let stack = default_stack();
    let mut report = success_report("whatever");
    report.status = ExecutionStatus::Unspecified as i32;
    let err = stack
        .execution
        .report_execution_result(Request::new(report))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn cancel_wins_over_a_late_success_report() {
    let stack = default_stack();
    let job_id = submit(&stack, "alice-token", "qpu", vec![1; 64]).await;
    assign(&stack, "qpu").await;

    stack
        .submission
        .cancel_job(Request::new(CancelJobRequest {
            token: "alice-token".into(),
            job_id: job_id.clone(),
        }))
        .await
        .unwrap();

    // The worker did not notice and reports success anyway.
    stack
        .execution
        .report_execution_result(Request::new(success_report(&job_id)))
        .await
        .unwrap();

    let record = stack.coordinator.get(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert!(record.result_ref.is_none());
    let late = record.late_report.unwrap();
    assert_eq!(late.reported_status, JobStatus::Completed);

    // The result is not exposed to the user.
    let result = stack
        .submission
        .get_job_result(Request::new(GetJobResultRequest {
            token: "alice-token".into(),
            job_id,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(result.result.is_none());
}

#[tokio::test]
async fn refresh_upload_url_requires_a_running_job() {
    let stack = default_stack();
    let job_id = submit(&stack, "alice-token", "qpu", vec![1; 64]).await;

    // Queued: not yet refreshable.
    let queued = stack
        .execution
        .refresh_upload_url(Request::new(RefreshUploadUrlRequest {
            job_id: job_id.clone(),
        }))
        .await
        .unwrap_err();
    assert_eq!(queued.code(), Code::FailedPrecondition);

    assign(&stack, "qpu").await;
    let refreshed = stack
        .execution
        .refresh_upload_url(Request::new(RefreshUploadUrlRequest {
            job_id: job_id.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    let target = refreshed.upload_target.unwrap();
    assert!(target.upload_url.contains(&format!("jobs/{job_id}/result")));

    stack
        .execution
        .report_execution_result(Request::new(success_report(&job_id)))
        .await
        .unwrap();
    let terminal = stack
        .execution
        .refresh_upload_url(Request::new(RefreshUploadUrlRequest { job_id }))
        .await
        .unwrap_err();
    assert_eq!(terminal.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn dispatch_is_fifo_within_a_backend() {
    let stack = default_stack();

    let mut submitted = Vec::new();
    for i in 0..3u8 {
        submitted.push(submit(&stack, "alice-token", "qpu", vec![i; 32]).await);
    }

    for expected in &submitted {
        let assigned = assign(&stack, "qpu").await;
        assert_eq!(&assigned.job_id, expected);
    }
}

#[tokio::test]
async fn unified_backends_share_one_fifo() {
    let stack = build_stack(StackOptions {
        unify_backends: true,
        ..Default::default()
    });

    // "emulator" is in maintenance, so submissions must still target a
    // serving backend; both land in the unified queue.
    let first = submit(&stack, "alice-token", "qpu", vec![1; 32]).await;
    let second = submit(&stack, "alice-token", "photonic-1", vec![2; 32]).await;

    assert_eq!(assign(&stack, "qpu").await.job_id, first);
    // Workers polling any known backend drain the same queue.
    assert_eq!(assign(&stack, "photonic-1").await.job_id, second);
}
