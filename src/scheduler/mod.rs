pub mod admission;
pub mod lifecycle;
pub mod queue;

pub use admission::{AdmissionController, AdmissionLimits, AdmissionOutcome};
pub use lifecycle::{ExecutionOutcome, LifecycleCoordinator, WorkerReport};
pub use queue::{EnqueueOutcome, JobQueue, QueueEntry};
