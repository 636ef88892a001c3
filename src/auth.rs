//! Identity-provider collaborator
//!
//! User authentication lives outside the gateway. [`IdentityProvider`] is
//! the seam: [`HttpIdentityProvider`] verifies bearer tokens against an
//! external userinfo endpoint, [`StaticIdentityProvider`] maps fixed tokens
//! for tests and development.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::domain::UserId;
use crate::error::{GatewayError, GatewayResult};

/// External bearer-token verifier
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolves a bearer token to the authenticated user
    ///
    /// # Errors
    ///
    /// `unauthorized` for unknown or expired tokens.
    async fn authenticate(&self, bearer_token: &str) -> GatewayResult<UserId>;

    /// Reachability probe for the startup checks
    async fn ping(&self) -> GatewayResult<()>;
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
}

/// Verifier backed by an HTTP userinfo endpoint
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityProvider {
    /// Client for the configured identity service
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn authenticate(&self, bearer_token: &str) -> GatewayResult<UserId> {
        let response = self
            .client
            .get(format!("{}/userinfo", self.base_url))
            .header("Authorization", format!("Bearer {bearer_token}"))
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("identity provider unreachable: {e}")))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "identity provider returned {}",
                response.status()
            )));
        }
        let info: UserInfo = response
            .json()
            .await
            .map_err(|e| GatewayError::internal(format!("bad userinfo payload: {e}")))?;
        UserId::try_new(info.sub).map_err(|_| GatewayError::Unauthorized)
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("identity provider unreachable: {e}")))?;
        Ok(())
    }
}

/// Fixed token table for tests and development
#[derive(Default)]
pub struct StaticIdentityProvider {
    tokens: DashMap<String, UserId>,
}

impl StaticIdentityProvider {
    /// Empty table; every token is rejected until added
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token for a user
    pub fn insert_token(&self, token: impl Into<String>, user: UserId) {
        self.tokens.insert(token.into(), user);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, bearer_token: &str) -> GatewayResult<UserId> {
        self.tokens
            .get(bearer_token)
            .map(|entry| entry.value().clone())
            .ok_or(GatewayError::Unauthorized)
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}
