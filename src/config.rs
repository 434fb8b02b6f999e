use std::net::SocketAddr;
use std::time::Duration;

use crate::scheduler::admission::{AdmissionLimits, RoleLimit};

const MIB: u64 = 1024 * 1024;

/// Runtime tunables. CLI flags select addresses and mode; everything else is
/// read from `SCHEDULER_*` environment variables with the defaults below.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub submission_addr: SocketAddr,
    pub execution_addr: SocketAddr,
    pub submission_max_workers: usize,
    pub execution_max_workers: usize,
    pub submission_max_message_bytes: usize,
    pub execution_max_message_bytes: usize,
    pub max_queue_bytes: u64,
    pub admission: AdmissionLimits,
    pub sweep_interval: Duration,
    pub unify_backends: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submission_addr: "[::]:8082".parse().unwrap(),
            execution_addr: "[::]:8081".parse().unwrap(),
            submission_max_workers: 100,
            execution_max_workers: 10,
            submission_max_message_bytes: (10 * MIB) as usize,
            execution_max_message_bytes: (10 * MIB) as usize,
            max_queue_bytes: 100 * MIB,
            admission: AdmissionLimits::default(),
            sweep_interval: Duration::from_secs(3),
            unify_backends: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            tracing::warn!(name, value = %value, "Unparseable environment variable, using default");
            default
        }),
        Err(_) => default,
    }
}

impl SchedulerConfig {
    /// Overlay the `SCHEDULER_*` environment tunables on the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let default_admission = defaults.admission;
        Self {
            submission_max_workers: env_parse(
                "SCHEDULER_SUBMISSION_MAX_WORKERS",
                defaults.submission_max_workers,
            ),
            execution_max_workers: env_parse(
                "SCHEDULER_EXECUTION_MAX_WORKERS",
                defaults.execution_max_workers,
            ),
            submission_max_message_bytes: env_parse(
                "SCHEDULER_SUBMISSION_MAX_MESSAGE_LENGTH",
                defaults.submission_max_message_bytes,
            ),
            execution_max_message_bytes: env_parse(
                "SCHEDULER_EXECUTION_MAX_MESSAGE_LENGTH",
                defaults.execution_max_message_bytes,
            ),
            max_queue_bytes: env_parse("SCHEDULER_MAX_QUEUE_BYTES", defaults.max_queue_bytes),
            admission: AdmissionLimits {
                admin: RoleLimit {
                    max_concurrent_jobs: env_parse(
                        "SCHEDULER_MAX_CONCURRENT_JOBS_ADMIN",
                        default_admission.admin.max_concurrent_jobs,
                    ),
                    max_job_bytes: env_parse(
                        "SCHEDULER_MAX_JOB_BYTES_ADMIN",
                        default_admission.admin.max_job_bytes,
                    ),
                },
                developer: RoleLimit {
                    max_concurrent_jobs: env_parse(
                        "SCHEDULER_MAX_CONCURRENT_JOBS_DEVELOPER",
                        default_admission.developer.max_concurrent_jobs,
                    ),
                    max_job_bytes: env_parse(
                        "SCHEDULER_MAX_JOB_BYTES_DEVELOPER",
                        default_admission.developer.max_job_bytes,
                    ),
                },
                guest: RoleLimit {
                    max_concurrent_jobs: env_parse(
                        "SCHEDULER_MAX_CONCURRENT_JOBS_GUEST",
                        default_admission.guest.max_concurrent_jobs,
                    ),
                    max_job_bytes: env_parse(
                        "SCHEDULER_MAX_JOB_BYTES_GUEST",
                        default_admission.guest.max_job_bytes,
                    ),
                },
            },
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SchedulerConfig::default();
        assert_eq!(config.submission_max_workers, 100);
        assert_eq!(config.execution_max_workers, 10);
        assert_eq!(config.max_queue_bytes, 100 * MIB);
        assert_eq!(config.admission.admin.max_concurrent_jobs, 1000);
        assert_eq!(config.admission.guest.max_job_bytes, MIB);
    }
}
