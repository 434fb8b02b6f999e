pub mod catalog;
pub mod config;
pub mod error;
pub mod grpc;
pub mod msglog;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod token;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("qcloud.scheduler.v1");

    /// Descriptor set for the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("scheduler_descriptor");
}

pub mod tokendb {
    tonic::include_proto!("qcloud.tokendb.v1");
}

/// Version string stamped into every job record at submission time.
pub const SCHEDULER_VERSION: &str = env!("CARGO_PKG_VERSION");
