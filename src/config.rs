//! Gateway configuration for development and production environments
//!
//! Pre-configured settings per deployment scenario with validation and
//! builder support.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ByteCap, QueueCapacity};

/// Inbound frames tolerated to be absent for this many heartbeat intervals
/// before the session is closed.
pub const HEARTBEAT_MISS_LIMIT: u32 = 3;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    /// Validation.
    Validation {
        /// Field.
        field: String,
        /// Reason.
        reason: String,
    },

    #[error("I/O error: {source}")]
    /// Io.
    Io {
        #[from]
        /// Source.
        source: std::io::Error,
    },

    #[error("serialization error: {source}")]
    /// Serialization.
    Serialization {
        #[from]
        /// Source.
        source: serde_json::Error,
    },
}

/// Idle interval after which the gateway emits a heartbeat frame
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct HeartbeatSeconds(u64);

impl HeartbeatSeconds {
    /// Converts to a Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.into_inner())
    }
}

/// Deadline in milliseconds for one agent round-trip
#[nutype(
    validate(less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct DispatchTimeoutMs(u64);

impl DispatchTimeoutMs {
    /// Converts to a Duration
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// External language-model endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Base URL of an OpenAI-compatible chat-completions service
    pub base_url: String,
    /// Bearer credential
    pub api_key: String,
    /// Model name sent with every request
    pub model: String,
    /// Independent deadline for one completion call, in milliseconds
    pub timeout_ms: DispatchTimeoutMs,
}

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    // Listener
    /// Bind addr.
    pub bind_addr: String,
    /// Http concurrency limit.
    pub http_concurrency_limit: QueueCapacity,

    // Agent sessions
    /// Session queue capacity.
    pub session_queue_capacity: QueueCapacity,
    /// Heartbeat interval.
    pub heartbeat_interval: HeartbeatSeconds,
    /// Handshake timeout ms.
    pub handshake_timeout_ms: DispatchTimeoutMs,

    // Correlator
    /// Dispatch timeout ms.
    pub dispatch_timeout_ms: DispatchTimeoutMs,

    // Status fan-out
    /// Subscriber queue capacity.
    pub subscriber_queue_capacity: QueueCapacity,
    /// Allowed origins.
    pub allowed_origins: Vec<String>,

    // CSV session pool
    /// Csv source cap.
    pub csv_source_cap: ByteCap,
    /// Csv session cap.
    pub csv_session_cap: ByteCap,
    /// Csv pool cap.
    pub csv_pool_cap: ByteCap,

    // Result rendering
    /// Summary sample rows.
    pub summary_sample_rows: usize,

    // Collaborators
    /// Llm.
    pub llm: LlmSettings,
    /// Identity base url.
    pub identity_base_url: String,
    /// Blob base url.
    pub blob_base_url: String,

    // Application store
    /// Database url.
    pub database_url: String,
}

impl GatewayConfig {
    /// Development preset: local collaborators, small caps, fast feedback
    ///
    /// # Panics
    /// Panics if any hardcoded value is out of range for its domain type
    #[must_use]
    pub fn development() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            http_concurrency_limit: QueueCapacity::try_new(256).unwrap(),
            session_queue_capacity: QueueCapacity::try_new(64).unwrap(),
            heartbeat_interval: HeartbeatSeconds::try_new(30).unwrap(),
            handshake_timeout_ms: DispatchTimeoutMs::try_new(5_000).unwrap(),
            dispatch_timeout_ms: DispatchTimeoutMs::try_new(10_000).unwrap(),
            subscriber_queue_capacity: QueueCapacity::try_new(32).unwrap(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            csv_source_cap: ByteCap::try_new(10 * 1024 * 1024).unwrap(),
            csv_session_cap: ByteCap::try_new(32 * 1024 * 1024).unwrap(),
            csv_pool_cap: ByteCap::try_new(128 * 1024 * 1024).unwrap(),
            summary_sample_rows: 50,
            llm: LlmSettings {
                base_url: "http://localhost:1234/v1".to_string(),
                api_key: "dev".to_string(),
                model: "gpt-4o-mini".to_string(),
                timeout_ms: DispatchTimeoutMs::try_new(20_000).unwrap(),
            },
            identity_base_url: "http://localhost:9090".to_string(),
            blob_base_url: "http://localhost:9000".to_string(),
            database_url: "sqlite::memory:".to_string(),
        }
    }

    /// Production preset: wildcarded origins, full caps, 30 s deadlines
    ///
    /// # Panics
    /// Panics if any hardcoded value is out of range for its domain type
    #[must_use]
    pub fn production() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            http_concurrency_limit: QueueCapacity::try_new(2_048).unwrap(),
            session_queue_capacity: QueueCapacity::try_new(256).unwrap(),
            heartbeat_interval: HeartbeatSeconds::try_new(30).unwrap(),
            handshake_timeout_ms: DispatchTimeoutMs::try_new(10_000).unwrap(),
            dispatch_timeout_ms: DispatchTimeoutMs::try_new(30_000).unwrap(),
            subscriber_queue_capacity: QueueCapacity::try_new(128).unwrap(),
            allowed_origins: vec![
                "https://app.custard.dev".to_string(),
                "https://*.custard.dev".to_string(),
            ],
            csv_source_cap: ByteCap::try_new(50 * 1024 * 1024).unwrap(),
            csv_session_cap: ByteCap::try_new(128 * 1024 * 1024).unwrap(),
            csv_pool_cap: ByteCap::try_new(512 * 1024 * 1024).unwrap(),
            summary_sample_rows: 100,
            llm: LlmSettings {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                model: "gpt-4o".to_string(),
                timeout_ms: DispatchTimeoutMs::try_new(30_000).unwrap(),
            },
            identity_base_url: "https://id.custard.dev".to_string(),
            blob_base_url: "https://blobs.custard.dev".to_string(),
            database_url: "sqlite://custard.db".to_string(),
        }
    }

    /// Testing preset: tiny caps and short deadlines so boundary behavior
    /// is cheap to exercise
    ///
    /// # Panics
    /// Panics if any hardcoded value is out of range for its domain type
    #[must_use]
    pub fn testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            http_concurrency_limit: QueueCapacity::try_new(64).unwrap(),
            session_queue_capacity: QueueCapacity::try_new(8).unwrap(),
            heartbeat_interval: HeartbeatSeconds::try_new(1).unwrap(),
            handshake_timeout_ms: DispatchTimeoutMs::try_new(2_000).unwrap(),
            dispatch_timeout_ms: DispatchTimeoutMs::try_new(1_000).unwrap(),
            subscriber_queue_capacity: QueueCapacity::try_new(4).unwrap(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            csv_source_cap: ByteCap::try_new(64 * 1024).unwrap(),
            csv_session_cap: ByteCap::try_new(256 * 1024).unwrap(),
            csv_pool_cap: ByteCap::try_new(512 * 1024).unwrap(),
            summary_sample_rows: 10,
            llm: LlmSettings {
                base_url: "http://localhost:0".to_string(),
                api_key: "test".to_string(),
                model: "test-model".to_string(),
                timeout_ms: DispatchTimeoutMs::try_new(1_000).unwrap(),
            },
            identity_base_url: "http://localhost:0".to_string(),
            blob_base_url: "http://localhost:0".to_string(),
            database_url: "sqlite::memory:".to_string(),
        }
    }

    /// Starts a builder seeded from the development preset
    #[must_use]
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: Self::development(),
        }
    }

    /// Validates cross-field constraints that domain types cannot express
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation {
                field: "bind_addr".to_string(),
                reason: format!("not a socket address: {}", self.bind_addr),
            });
        }
        if self.allowed_origins.is_empty() {
            return Err(ConfigError::Validation {
                field: "allowed_origins".to_string(),
                reason: "at least one origin must be allowed".to_string(),
            });
        }
        if self.csv_session_cap.as_u64() > self.csv_pool_cap.as_u64() {
            return Err(ConfigError::Validation {
                field: "csv_session_cap".to_string(),
                reason: "per-session cap exceeds the aggregate pool cap".to_string(),
            });
        }
        if self.database_url.is_empty() {
            return Err(ConfigError::Validation {
                field: "database_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.llm.base_url.is_empty() {
            return Err(ConfigError::Validation {
                field: "llm.base_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`GatewayConfig`]
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    #[must_use]
    /// Bind addr.
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    #[must_use]
    /// Session queue capacity.
    pub fn session_queue_capacity(mut self, capacity: QueueCapacity) -> Self {
        self.config.session_queue_capacity = capacity;
        self
    }

    #[must_use]
    /// Heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: HeartbeatSeconds) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    #[must_use]
    /// Dispatch timeout ms.
    pub fn dispatch_timeout_ms(mut self, timeout: DispatchTimeoutMs) -> Self {
        self.config.dispatch_timeout_ms = timeout;
        self
    }

    #[must_use]
    /// Allowed origins.
    pub fn allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.config.allowed_origins = origins;
        self
    }

    #[must_use]
    /// Csv caps.
    pub fn csv_caps(mut self, source: ByteCap, session: ByteCap, pool: ByteCap) -> Self {
        self.config.csv_source_cap = source;
        self.config.csv_session_cap = session;
        self.config.csv_pool_cap = pool;
        self
    }

    #[must_use]
    /// Llm.
    pub fn llm(mut self, settings: LlmSettings) -> Self {
        self.config.llm = settings;
        self
    }

    #[must_use]
    /// Database url.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    /// Finalizes and validates the configuration
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if validation fails.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        assert!(GatewayConfig::development().validate().is_ok());
        assert!(GatewayConfig::production().validate().is_ok());
        assert!(GatewayConfig::testing().validate().is_ok());
    }

    #[test]
    fn builder_overrides_and_validates() {
        let config = GatewayConfig::builder()
            .bind_addr("127.0.0.1:9999")
            .dispatch_timeout_ms(DispatchTimeoutMs::try_new(5_000).unwrap())
            .build()
            .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9999");
        assert_eq!(config.dispatch_timeout_ms.as_u64(), 5_000);
    }

    #[test]
    fn session_cap_must_fit_inside_pool_cap() {
        let result = GatewayConfig::builder()
            .csv_caps(
                ByteCap::try_new(1024).unwrap(),
                ByteCap::try_new(4096).unwrap(),
                ByteCap::try_new(2048).unwrap(),
            )
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::Validation { field, .. }) if field == "csv_session_cap"
        ));
    }

    #[test]
    fn empty_origin_list_is_rejected() {
        let result = GatewayConfig::builder().allowed_origins(vec![]).build();
        assert!(result.is_err());
    }
}
