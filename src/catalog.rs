use std::sync::Arc;

use serde::Deserialize;

use crate::error::SchedulerError;
use crate::store::params::ParameterStore;

/// Canonical queue name used when `--unify-backends` is set.
pub const UNIFIED_BACKEND: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Available,
    Unavailable,
    Maintenance,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendStatus::Available => write!(f, "available"),
            BackendStatus::Unavailable => write!(f, "unavailable"),
            BackendStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntry {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub status: BackendStatus,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    backend: Vec<BackendEntry>,
}

/// Outcome of resolving a user-supplied backend name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResolution {
    /// Queue key after alias and unification rewriting.
    pub canonical: String,
    pub status: BackendStatus,
    pub description: String,
}

impl BackendResolution {
    pub fn is_dispatch_eligible(&self) -> bool {
        self.status == BackendStatus::Available
    }
}

/// Catalog of execution backends, loaded from a TOML document in the
/// parameter store. The document is re-read on every resolution so that
/// operators can flip a backend to maintenance without restarting us.
pub struct BackendCatalog {
    params: Arc<dyn ParameterStore>,
    parameter_name: String,
    unify_backends: bool,
}

impl BackendCatalog {
    pub fn new(
        params: Arc<dyn ParameterStore>,
        parameter_name: impl Into<String>,
        unify_backends: bool,
    ) -> Self {
        Self {
            params,
            parameter_name: parameter_name.into(),
            unify_backends,
        }
    }

    /// Validates that the catalog document exists and parses. Called once at
    /// startup so a broken deployment fails fast.
    pub async fn validate(&self) -> Result<(), SchedulerError> {
        self.load().await.map(|_| ())
    }

    async fn load(&self) -> Result<Vec<BackendEntry>, SchedulerError> {
        // One local retry on parameter-store failure; a second failure is
        // surfaced as INTERNAL.
        let document = match self.params.get_parameter(&self.parameter_name).await {
            Ok(value) => value,
            Err(first) => {
                tracing::warn!(error = %first, parameter = %self.parameter_name,
                    "Retrying backend status fetch");
                self.params.get_parameter(&self.parameter_name).await?
            }
        };
        let document = document.ok_or_else(|| {
            SchedulerError::Internal(format!(
                "backend status parameter '{}' not found",
                self.parameter_name
            ))
        })?;

        let parsed: CatalogDocument = toml::from_str(&document).map_err(|e| {
            SchedulerError::Internal(format!("malformed backend status document: {e}"))
        })?;
        Ok(parsed.backend)
    }

    /// Resolve a user-supplied backend name to its canonical queue and current
    /// status. Alias matching happens before unification, so an unknown name
    /// is rejected even under `--unify-backends`.
    pub async fn resolve(&self, requested: &str) -> Result<BackendResolution, SchedulerError> {
        let entries = self.load().await?;
        let entry = entries
            .iter()
            .find(|e| e.name == requested || e.aliases.iter().any(|a| a == requested))
            .ok_or_else(|| SchedulerError::UnknownBackend(requested.to_string()))?;

        let canonical = if self.unify_backends {
            UNIFIED_BACKEND.to_string()
        } else {
            entry.name.clone()
        };

        Ok(BackendResolution {
            canonical,
            status: entry.status,
            description: entry.description.clone(),
        })
    }

    /// Canonical queue names currently served. Used by startup recovery to
    /// decide which queued records can be re-enqueued.
    pub async fn canonical_backends(&self) -> Result<Vec<String>, SchedulerError> {
        if self.unify_backends {
            return Ok(vec![UNIFIED_BACKEND.to_string()]);
        }
        Ok(self.load().await?.into_iter().map(|e| e.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::params::MemoryParameterStore;

    const STATUS_TOML: &str = r#"
        [[backend]]
        name = "qpu"
        aliases = ["photonic-1"]
        status = "available"
        description = "Photonic QPU"

        [[backend]]
        name = "emulator"
        status = "maintenance"
        description = "Weekly calibration"
    "#;

    fn catalog(unify: bool) -> BackendCatalog {
        let params = MemoryParameterStore::new();
        params.set("backend-status", STATUS_TOML);
        BackendCatalog::new(Arc::new(params), "backend-status", unify)
    }

    #[tokio::test]
    async fn resolves_aliases() {
        let resolution = catalog(false).resolve("photonic-1").await.unwrap();
        assert_eq!(resolution.canonical, "qpu");
        assert!(resolution.is_dispatch_eligible());
    }

    #[tokio::test]
    async fn maintenance_is_not_dispatch_eligible() {
        let resolution = catalog(false).resolve("emulator").await.unwrap();
        assert_eq!(resolution.status, BackendStatus::Maintenance);
        assert!(!resolution.is_dispatch_eligible());
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let err = catalog(false).resolve("gpu").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownBackend(_)));
    }

    #[tokio::test]
    async fn unification_rewrites_canonical_but_keeps_validation() {
        let unified = catalog(true);
        let resolution = unified.resolve("emulator").await.unwrap();
        assert_eq!(resolution.canonical, UNIFIED_BACKEND);

        let err = unified.resolve("gpu").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownBackend(_)));

        assert_eq!(
            unified.canonical_backends().await.unwrap(),
            vec![UNIFIED_BACKEND.to_string()]
        );
    }
}
