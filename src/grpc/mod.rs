pub mod convert;
pub mod execution_service;
pub mod server;
pub mod submission_service;

pub use execution_service::ExecutionServer;
pub use server::GrpcServers;
pub use submission_service::SubmissionServer;
