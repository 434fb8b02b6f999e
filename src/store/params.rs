use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParameterStoreError {
    #[error("parameter store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only view of the external parameter store. The scheduler fetches the
/// bucket name, table name, and backend-status document through this seam.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Returns `None` when the parameter does not exist.
    async fn get_parameter(&self, name: &str) -> Result<Option<String>, ParameterStoreError>;
}

/// In-memory parameter store used by tests and `--dev` mode.
#[derive(Default)]
pub struct MemoryParameterStore {
    params: Mutex<HashMap<String, String>>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.params.lock().unwrap().insert(name.into(), value.into());
    }
}

#[async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn get_parameter(&self, name: &str) -> Result<Option<String>, ParameterStoreError> {
        Ok(self.params.lock().unwrap().get(name).cloned())
    }
}
