use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::store::record::Role;
use crate::tokendb::token_database_service_client::TokenDatabaseServiceClient;
use crate::tokendb::{DatabaseOperationStatus, GetTokenInfoRequest};

/// Identity resolved from an opaque token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub name: String,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry < now)
    }
}

#[derive(Debug, Error)]
pub enum TokenResolveError {
    #[error("token database unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of token → identity against the external token database. The
/// contract forbids caching: revocations must be visible on the next call.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    /// Returns `None` when the token is unknown.
    async fn resolve(&self, token: &str) -> Result<Option<TokenInfo>, TokenResolveError>;
}

/// Resolver backed by the token database gRPC service. A fresh channel per
/// call keeps the no-cache contract trivially true.
pub struct GrpcTokenResolver {
    address: String,
}

impl GrpcTokenResolver {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl TokenResolver for GrpcTokenResolver {
    async fn resolve(&self, token: &str) -> Result<Option<TokenInfo>, TokenResolveError> {
        let endpoint = format!("http://{}", self.address);
        let mut client = TokenDatabaseServiceClient::connect(endpoint)
            .await
            .map_err(|e| TokenResolveError::Unavailable(e.to_string()))?;

        let response = client
            .get_token_info(GetTokenInfoRequest {
                token: token.to_string(),
            })
            .await
            .map_err(|e| TokenResolveError::Unavailable(e.to_string()))?
            .into_inner();

        match response.status() {
            DatabaseOperationStatus::Ok => {
                let info = response.token_info.unwrap_or_default();
                let expires_at = info.expires_at.and_then(|ts| {
                    if ts.seconds > 0 {
                        Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32).single()
                    } else {
                        None
                    }
                });
                Ok(Some(TokenInfo {
                    name: info.name,
                    role: Role::from_name(&info.role),
                    expires_at,
                }))
            }
            DatabaseOperationStatus::NotFound => Ok(None),
            DatabaseOperationStatus::Unspecified => Err(TokenResolveError::Unavailable(format!(
                "token database returned an unexpected status: {}",
                response.detail
            ))),
        }
    }
}

/// Fixed token table used by tests and `--dev` mode.
#[derive(Default)]
pub struct StaticTokenResolver {
    tokens: Mutex<HashMap<String, TokenInfo>>,
}

impl StaticTokenResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, info: TokenInfo) {
        self.tokens.lock().unwrap().insert(token.into(), info);
    }
}

#[async_trait]
impl TokenResolver for StaticTokenResolver {
    async fn resolve(&self, token: &str) -> Result<Option<TokenInfo>, TokenResolveError> {
        Ok(self.tokens.lock().unwrap().get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let expired = TokenInfo {
            name: "alice".into(),
            role: Role::Developer,
            expires_at: Some(now - chrono::Duration::seconds(1)),
        };
        let valid = TokenInfo {
            name: "bob".into(),
            role: Role::Guest,
            expires_at: None,
        };
        assert!(expired.is_expired(now));
        assert!(!valid.is_expired(now));
    }
}
