pub mod object;
pub mod params;
pub mod record;

pub use object::{MemoryObjectStore, ObjectStoreGateway, PresignedUrl};
pub use params::{MemoryParameterStore, ParameterStore};
pub use record::{JobRecord, JobStatus, MemoryRecordStore, RecordStore, Role};
