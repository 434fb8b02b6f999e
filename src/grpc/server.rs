use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::config::SchedulerConfig;
use crate::grpc::execution_service::ExecutionServer;
use crate::grpc::submission_service::SubmissionServer;
use crate::proto::execution_service_server::ExecutionServiceServer;
use crate::proto::submission_service_server::SubmissionServiceServer;

/// The two scheduler listeners: user-facing submission and worker-facing
/// execution. Each gets its own port, health and reflection services, and
/// message-size limit.
pub struct GrpcServers {
    config: SchedulerConfig,
    submission: SubmissionServer,
    execution: ExecutionServer,
}

impl GrpcServers {
    pub fn new(
        config: SchedulerConfig,
        submission: SubmissionServer,
        execution: ExecutionServer,
    ) -> Self {
        Self {
            config,
            submission,
            execution,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let (mut submission_health, submission_health_service) =
            tonic_health::server::health_reporter();
        submission_health
            .set_serving::<SubmissionServiceServer<SubmissionServer>>()
            .await;
        let submission_service = SubmissionServiceServer::new(self.submission)
            .max_decoding_message_size(self.config.submission_max_message_bytes)
            .max_encoding_message_size(self.config.submission_max_message_bytes);

        let (mut execution_health, execution_health_service) =
            tonic_health::server::health_reporter();
        execution_health
            .set_serving::<ExecutionServiceServer<ExecutionServer>>()
            .await;
        let execution_service = ExecutionServiceServer::new(self.execution)
            .max_decoding_message_size(self.config.execution_max_message_bytes)
            .max_encoding_message_size(self.config.execution_max_message_bytes);

        // One reflection service per listener, both advertising the embedded
        // descriptor set. Building only fails on a corrupted build.
        let submission_reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(crate::proto::FILE_DESCRIPTOR_SET)
            .build_v1()
            .expect("invalid embedded file descriptor set");
        let execution_reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(crate::proto::FILE_DESCRIPTOR_SET)
            .build_v1()
            .expect("invalid embedded file descriptor set");

        tracing::info!(
            submission_addr = %self.config.submission_addr,
            execution_addr = %self.config.execution_addr,
            "Starting scheduler gRPC servers"
        );

        let submission = Server::builder()
            .concurrency_limit_per_connection(self.config.submission_max_workers)
            .add_service(submission_health_service)
            .add_service(submission_reflection)
            .add_service(submission_service)
            .serve_with_shutdown(
                self.config.submission_addr,
                shutdown.clone().cancelled_owned(),
            );

        let execution = Server::builder()
            .concurrency_limit_per_connection(self.config.execution_max_workers)
            .add_service(execution_health_service)
            .add_service(execution_reflection)
            .add_service(execution_service)
            .serve_with_shutdown(self.config.execution_addr, shutdown.cancelled_owned());

        tokio::try_join!(submission, execution)?;
        Ok(())
    }
}
