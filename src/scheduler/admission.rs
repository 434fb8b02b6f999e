use std::collections::HashMap;
use std::sync::Mutex;

use crate::store::record::Role;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleLimit {
    pub max_concurrent_jobs: u32,
    pub max_job_bytes: u64,
}

/// Per-role admission limits. Lookup is total: every role maps to a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub admin: RoleLimit,
    pub developer: RoleLimit,
    pub guest: RoleLimit,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            admin: RoleLimit {
                max_concurrent_jobs: 1000,
                max_job_bytes: 10 * MIB,
            },
            developer: RoleLimit {
                max_concurrent_jobs: 10,
                max_job_bytes: 10 * MIB,
            },
            guest: RoleLimit {
                max_concurrent_jobs: 5,
                max_job_bytes: MIB,
            },
        }
    }
}

impl AdmissionLimits {
    pub fn for_role(&self, role: Role) -> RoleLimit {
        match role {
            Role::Admin => self.admin,
            Role::Developer => self.developer,
            Role::Guest => self.guest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admitted,
    QuotaExceeded,
    PayloadTooLarge { limit: u64 },
}

/// Tracks active jobs per role and admits or rejects new submissions.
/// All operations are O(1) under one mutex; callers are never blocked.
pub struct AdmissionController {
    limits: AdmissionLimits,
    active: Mutex<HashMap<Role, u32>>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic check-and-increment. The slot is held until `release` is called
    /// for the same role.
    pub fn try_reserve(&self, role: Role, size_bytes: u64) -> AdmissionOutcome {
        let limit = self.limits.for_role(role);
        if size_bytes > limit.max_job_bytes {
            return AdmissionOutcome::PayloadTooLarge {
                limit: limit.max_job_bytes,
            };
        }

        let mut active = self.active.lock().unwrap();
        let count = active.entry(role).or_insert(0);
        if *count >= limit.max_concurrent_jobs {
            return AdmissionOutcome::QuotaExceeded;
        }
        *count += 1;
        AdmissionOutcome::Admitted
    }

    /// Release one slot. A release without a matching reserve indicates a
    /// coordinator bug; it is logged and otherwise ignored.
    pub fn release(&self, role: Role) {
        let mut active = self.active.lock().unwrap();
        match active.get_mut(&role) {
            Some(count) if *count > 0 => *count -= 1,
            _ => tracing::warn!(role = %role, "Admission release without a held slot"),
        }
    }

    pub fn active_jobs(&self, role: Role) -> u32 {
        *self.active.lock().unwrap().get(&role).unwrap_or(&0)
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }
}
