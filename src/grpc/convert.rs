//! Mapping between domain types and the generated protobuf messages.

use chrono::{DateTime, TimeZone, Utc};

use crate::proto;
use crate::store::record::{JobRecord, JobStatus, JobTimestamps, StateSavePolicy};

pub fn timestamp_to_proto(dt: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

pub fn timestamp_from_proto(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32).single()
}

fn opt_timestamp_to_proto(dt: Option<DateTime<Utc>>) -> Option<prost_types::Timestamp> {
    dt.map(timestamp_to_proto)
}

pub fn duration_from_proto(d: &prost_types::Duration) -> std::time::Duration {
    std::time::Duration::new(d.seconds.max(0) as u64, d.nanos.max(0) as u32)
}

pub fn duration_to_proto(d: std::time::Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

pub fn status_to_proto(status: JobStatus) -> proto::JobStatus {
    match status {
        JobStatus::Queued => proto::JobStatus::Queued,
        JobStatus::Running => proto::JobStatus::Running,
        JobStatus::Completed => proto::JobStatus::Completed,
        JobStatus::Failed => proto::JobStatus::Failed,
        JobStatus::Cancelled => proto::JobStatus::Cancelled,
        JobStatus::Timeout => proto::JobStatus::Timeout,
    }
}

pub fn save_policy_from_proto(policy: proto::JobStateSavePolicy) -> StateSavePolicy {
    match policy {
        proto::JobStateSavePolicy::Unspecified => StateSavePolicy::Unspecified,
        proto::JobStateSavePolicy::All => StateSavePolicy::All,
        proto::JobStateSavePolicy::FirstOnly => StateSavePolicy::FirstOnly,
        proto::JobStateSavePolicy::None => StateSavePolicy::None,
    }
}

pub fn save_policy_to_proto(policy: StateSavePolicy) -> proto::JobStateSavePolicy {
    match policy {
        StateSavePolicy::Unspecified => proto::JobStateSavePolicy::Unspecified,
        StateSavePolicy::All => proto::JobStateSavePolicy::All,
        StateSavePolicy::FirstOnly => proto::JobStateSavePolicy::FirstOnly,
        StateSavePolicy::None => proto::JobStateSavePolicy::None,
    }
}

pub fn timestamps_to_proto(ts: &JobTimestamps) -> proto::JobTimestamps {
    proto::JobTimestamps {
        submitted_at: opt_timestamp_to_proto(ts.submitted_at),
        queued_at: opt_timestamp_to_proto(ts.queued_at),
        dequeued_at: opt_timestamp_to_proto(ts.dequeued_at),
        compile_started_at: opt_timestamp_to_proto(ts.compile_started_at),
        compile_finished_at: opt_timestamp_to_proto(ts.compile_finished_at),
        execution_started_at: opt_timestamp_to_proto(ts.execution_started_at),
        execution_finished_at: opt_timestamp_to_proto(ts.execution_finished_at),
        finished_at: opt_timestamp_to_proto(ts.finished_at),
    }
}

pub fn timestamps_from_proto(ts: &proto::JobTimestamps) -> JobTimestamps {
    JobTimestamps {
        submitted_at: ts.submitted_at.as_ref().and_then(timestamp_from_proto),
        queued_at: ts.queued_at.as_ref().and_then(timestamp_from_proto),
        dequeued_at: ts.dequeued_at.as_ref().and_then(timestamp_from_proto),
        compile_started_at: ts.compile_started_at.as_ref().and_then(timestamp_from_proto),
        compile_finished_at: ts.compile_finished_at.as_ref().and_then(timestamp_from_proto),
        execution_started_at: ts.execution_started_at.as_ref().and_then(timestamp_from_proto),
        execution_finished_at: ts
            .execution_finished_at
            .as_ref()
            .and_then(timestamp_from_proto),
        finished_at: ts.finished_at.as_ref().and_then(timestamp_from_proto),
    }
}

pub fn backend_status_to_proto(status: crate::catalog::BackendStatus) -> proto::ServiceStatus {
    match status {
        crate::catalog::BackendStatus::Available => proto::ServiceStatus::Available,
        crate::catalog::BackendStatus::Unavailable => proto::ServiceStatus::Unavailable,
        crate::catalog::BackendStatus::Maintenance => proto::ServiceStatus::Maintenance,
    }
}

pub fn execution_details(record: &JobRecord) -> proto::JobExecutionDetails {
    proto::JobExecutionDetails {
        version: Some(proto::JobExecutionVersion {
            physical_lab_version: record.exec_version.physical_lab.clone(),
            scheduler_version: record.exec_version.scheduler.clone(),
            simulator_version: record.exec_version.simulator.clone(),
        }),
        timestamps: Some(timestamps_to_proto(&record.timestamps)),
    }
}
