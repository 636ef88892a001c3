//! Error taxonomy for the Custard gateway
//!
//! Every failure that crosses the HTTP surface or the agent wire carries one
//! stable [`ErrorCode`]; messages are human-readable and never include stack
//! traces or SQL the user did not intend.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::AgentId;

/// Stable machine-readable failure codes, shared by HTTP bodies and
/// agent-wire `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Agent unreachable.
    AgentUnreachable,
    /// Timeout.
    Timeout,
    /// Unauthorized.
    Unauthorized,
    /// Not found.
    NotFound,
    /// Unsafe query.
    UnsafeQuery,
    /// Too large.
    TooLarge,
    /// No data source.
    NoDataSource,
    /// Llm timeout.
    LlmTimeout,
    /// Shutdown.
    Shutdown,
    /// Superseded.
    Superseded,
    /// Internal.
    Internal,
}

impl ErrorCode {
    /// The wire spelling of the code
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentUnreachable => "agent_unreachable",
            Self::Timeout => "timeout",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::UnsafeQuery => "unsafe_query",
            Self::TooLarge => "too_large",
            Self::NoDataSource => "no_data_source",
            Self::LlmTimeout => "llm_timeout",
            Self::Shutdown => "shutdown",
            Self::Superseded => "superseded",
            Self::Internal => "internal",
        }
    }

    /// HTTP status the code maps to on the control-plane surface
    #[must_use]
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsafeQuery | Self::NoDataSource => StatusCode::BAD_REQUEST,
            Self::Timeout | Self::LlmTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::AgentUnreachable | Self::Superseded => StatusCode::BAD_GATEWAY,
            Self::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway-wide error type
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no live session for agent {agent_id}")]
    /// Agent unreachable.
    AgentUnreachable {
        /// Agent id.
        agent_id: AgentId,
    },

    #[error("request to agent {agent_id} did not complete within {timeout_ms}ms")]
    /// Timeout.
    Timeout {
        /// Agent id.
        agent_id: AgentId,
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },

    #[error("unauthorized")]
    /// Unauthorized.
    Unauthorized,

    #[error("{entity} not found")]
    /// Not found.
    NotFound {
        /// Entity.
        entity: &'static str,
    },

    #[error("generated SQL was rejected by the safety check: {detail}")]
    /// Unsafe query.
    UnsafeQuery {
        /// Detail.
        detail: String,
    },

    #[error("{what} exceeds the configured limit of {cap} bytes")]
    /// Too large.
    TooLarge {
        /// What.
        what: &'static str,
        /// Cap.
        cap: u64,
    },

    #[error("the query named no connection and no file")]
    /// No data source.
    NoDataSource,

    #[error("language model call did not complete within {timeout_ms}ms")]
    /// Llm timeout.
    LlmTimeout {
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },

    #[error("language model call failed: {detail}")]
    /// Llm failed.
    LlmFailed {
        /// Detail.
        detail: String,
    },

    #[error("gateway is shutting down")]
    /// Shutdown.
    Shutdown,

    #[error("session displaced by a newer connection for the same agent")]
    /// Superseded.
    Superseded,

    #[error("agent reported failure: {message}")]
    /// Agent error.
    AgentError {
        /// Code.
        code: String,
        /// Message.
        message: String,
    },

    #[error("storage error: {0}")]
    /// Storage.
    Storage(#[from] sqlx::Error),

    #[error("internal error: {detail}")]
    /// Internal.
    Internal {
        /// Detail.
        detail: String,
    },
}

impl GatewayError {
    /// The stable code this error carries across the wire
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AgentUnreachable { .. } => ErrorCode::AgentUnreachable,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::UnsafeQuery { .. } => ErrorCode::UnsafeQuery,
            Self::TooLarge { .. } => ErrorCode::TooLarge,
            Self::NoDataSource => ErrorCode::NoDataSource,
            Self::LlmTimeout { .. } => ErrorCode::LlmTimeout,
            Self::LlmFailed { .. } | Self::AgentError { .. } => ErrorCode::Internal,
            Self::Shutdown => ErrorCode::Shutdown,
            Self::Superseded => ErrorCode::Superseded,
            Self::Storage(_) | Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    /// Convenience constructor for internal failures
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }
}

/// JSON error body returned by every failed control-plane call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code
    pub code: ErrorCode,
    /// Human-readable message; may quote LLM text, never a stack trace
    pub message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let code = self.code();
        let message = match &self {
            // Storage details stay in the logs, not in the response body.
            Self::Storage(err) => {
                tracing::error!(error = %err, "storage failure");
                "internal storage failure".to_string()
            }
            other => other.to_string(),
        };
        (code.http_status(), Json(ErrorBody { code, message })).into_response()
    }
}

/// Gateway result alias
pub type GatewayResult<T> = Result<T, GatewayError>;
