use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use qcloud_scheduler::catalog::BackendCatalog;
use qcloud_scheduler::config::SchedulerConfig;
use qcloud_scheduler::grpc::{ExecutionServer, GrpcServers, SubmissionServer};
use qcloud_scheduler::msglog::MessageLog;
use qcloud_scheduler::scheduler::{AdmissionController, JobQueue, LifecycleCoordinator};
use qcloud_scheduler::shutdown::shutdown_token;
use qcloud_scheduler::store::{MemoryObjectStore, MemoryParameterStore, MemoryRecordStore};
use qcloud_scheduler::token::GrpcTokenResolver;

/// Backend catalog used when `--dev` runs without a parameter store.
const DEV_BACKEND_STATUS: &str = r#"
[[backend]]
name = "qpu"
aliases = ["photonic-1"]
status = "available"
description = "Development QPU stub"

[[backend]]
name = "emulator"
status = "available"
description = "Development emulator stub"
"#;

#[derive(Parser, Debug)]
#[command(name = "qcloud-scheduler")]
#[command(about = "Job scheduler for the quantum-computing cloud control plane")]
struct Args {
    /// Listen address of the user-facing submission service
    #[arg(long, default_value = "[::]:8082")]
    port_for_submission: SocketAddr,

    /// Listen address of the worker-facing execution service
    #[arg(long, default_value = "[::]:8081")]
    port_for_execution: SocketAddr,

    /// Address of the external token database service
    #[arg(long = "address_to_token_database", default_value = "token-database:8084")]
    address_to_token_database: String,

    #[arg(long)]
    aws_access_key_id: Option<String>,

    #[arg(long)]
    aws_secret_access_key: Option<String>,

    #[arg(long, env = "AWS_REGION", default_value = "")]
    region: String,

    /// Parameter-store key holding the job bucket name
    #[arg(long, env = "JOB_BUCKET_NAME_KEY", default_value = "")]
    job_bucket_name_key: String,

    /// Parameter-store key holding the job table name
    #[arg(long, env = "DYNAMODB_JOB_TABLE_NAME_KEY", default_value = "")]
    job_table_name_key: String,

    /// Parameter-store key holding the backend status document
    #[arg(
        long,
        env = "BACKEND_STATUS_PARAMETER_NAME",
        default_value = "scheduler/backend-status"
    )]
    backend_status_parameter_name: String,

    /// Collapse every backend into a single dispatch queue
    #[arg(long)]
    unify_backends: bool,

    /// Run with in-memory stores for local development
    #[arg(long)]
    dev: bool,

    /// Store endpoint override for development; only effective with --dev
    #[arg(long)]
    endpoint: Option<String>,

    /// Object-store endpoint override for development; overrides --endpoint
    #[arg(long)]
    s3_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if !args.dev && (args.endpoint.is_some() || args.s3_endpoint.is_some()) {
        return Err("--endpoint/--s3_endpoint can only be used with --dev".into());
    }
    if !args.dev {
        // The cloud-store gateways are injected by the embedding deployment
        // through the library API; the binary itself only ships the in-memory
        // development stack.
        return Err("this binary only supports --dev; see DESIGN.md".into());
    }

    if args.aws_access_key_id.is_some() || args.aws_secret_access_key.is_some() {
        tracing::debug!("Using static cloud credentials from the command line");
    }
    tracing::debug!(
        region = %args.region,
        bucket_key = %args.job_bucket_name_key,
        table_key = %args.job_table_name_key,
        endpoint = ?args.endpoint,
        s3_endpoint = ?args.s3_endpoint,
        "External store configuration"
    );

    let mut config = SchedulerConfig::from_env();
    config.submission_addr = args.port_for_submission;
    config.execution_addr = args.port_for_execution;
    config.unify_backends = args.unify_backends;

    tracing::info!(
        submission_addr = %config.submission_addr,
        execution_addr = %config.execution_addr,
        unify_backends = config.unify_backends,
        token_database = %args.address_to_token_database,
        "Starting qcloud-scheduler"
    );

    let params = Arc::new(MemoryParameterStore::new());
    params.set(args.backend_status_parameter_name.as_str(), DEV_BACKEND_STATUS);
    let records = Arc::new(MemoryRecordStore::new());
    let objects = Arc::new(MemoryObjectStore::new());

    let catalog = Arc::new(BackendCatalog::new(
        params,
        args.backend_status_parameter_name.as_str(),
        config.unify_backends,
    ));
    catalog.validate().await?;

    let admission = Arc::new(AdmissionController::new(config.admission));
    let queue = Arc::new(JobQueue::new(config.max_queue_bytes));
    let msglog = Arc::new(MessageLog::new());
    let coordinator = Arc::new(LifecycleCoordinator::new(
        records,
        objects.clone(),
        admission.clone(),
        msglog,
    ));

    coordinator.recover(&queue, &catalog).await?;

    let shutdown = shutdown_token();
    let sweeper = coordinator.spawn_timeout_sweeper(config.sweep_interval, shutdown.clone());

    let tokens = Arc::new(GrpcTokenResolver::new(args.address_to_token_database));
    let submission = SubmissionServer::new(
        tokens,
        catalog.clone(),
        coordinator.clone(),
        admission,
        queue.clone(),
        objects.clone(),
    );
    let execution = ExecutionServer::new(
        catalog,
        coordinator,
        queue,
        objects,
        shutdown.clone(),
    );

    GrpcServers::new(config, submission, execution)
        .run(shutdown)
        .await?;
    sweeper.abort();

    Ok(())
}
