use thiserror::Error;

use crate::store::object::ObjectStoreError;
use crate::store::params::ParameterStoreError;
use crate::store::record::{RecordStoreError, Role};
use crate::token::TokenResolveError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("token does not own job {0}")]
    Unauthorized(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("backend {0} is not accepting jobs")]
    BackendUnavailable(String),

    #[error("concurrent job quota exceeded for role {0}")]
    QuotaExceeded(Role),

    #[error("job payload of {size} bytes exceeds the {limit}-byte limit for role {role}")]
    PayloadTooLarge { role: Role, size: u64, limit: u64 },

    #[error("job queue is out of memory")]
    ResourceExhausted,

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {0} already reached a terminal status")]
    AlreadyTerminal(String),

    #[error("illegal status transition: {0}")]
    IllegalTransition(String),

    #[error("record for job {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl From<RecordStoreError> for SchedulerError {
    fn from(e: RecordStoreError) -> Self {
        match e {
            RecordStoreError::VersionConflict { job_id, .. } => {
                SchedulerError::ConcurrentModification(job_id)
            }
            other => SchedulerError::Internal(other.to_string()),
        }
    }
}

impl From<ObjectStoreError> for SchedulerError {
    fn from(e: ObjectStoreError) -> Self {
        SchedulerError::Internal(e.to_string())
    }
}

impl From<ParameterStoreError> for SchedulerError {
    fn from(e: ParameterStoreError) -> Self {
        SchedulerError::Internal(e.to_string())
    }
}

impl From<TokenResolveError> for SchedulerError {
    fn from(e: TokenResolveError) -> Self {
        SchedulerError::Internal(e.to_string())
    }
}

impl From<SchedulerError> for tonic::Status {
    fn from(e: SchedulerError) -> Self {
        let message = e.to_string();
        match e {
            SchedulerError::Unauthenticated(_) => tonic::Status::unauthenticated(message),
            SchedulerError::Unauthorized(_) => tonic::Status::permission_denied(message),
            SchedulerError::UnknownBackend(_) | SchedulerError::PayloadTooLarge { .. } => {
                tonic::Status::invalid_argument(message)
            }
            SchedulerError::BackendUnavailable(_)
            | SchedulerError::AlreadyTerminal(_)
            | SchedulerError::IllegalTransition(_) => tonic::Status::failed_precondition(message),
            SchedulerError::QuotaExceeded(_) | SchedulerError::ResourceExhausted => {
                tonic::Status::resource_exhausted(message)
            }
            SchedulerError::NotFound(_) => tonic::Status::not_found(message),
            SchedulerError::ConcurrentModification(_) => tonic::Status::aborted(message),
            SchedulerError::Internal(_) => tonic::Status::internal(message),
        }
    }
}
