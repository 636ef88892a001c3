//! Gateway context
//!
//! One composite handle owning every shared component; there are no
//! process-wide singletons. Startup constructs it after the collaborator
//! reachability checks pass, every request handler borrows it, shutdown
//! disposes it in dependency order.

use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::IdentityProvider;
use crate::blob::BlobStore;
use crate::config::GatewayConfig;
use crate::correlator::Correlator;
use crate::csv::analytic::AnalyticCsvEngine;
use crate::csv::pool::CsvSessionPool;
use crate::domain::{AgentId, AgentKey, ConnectionId, DbKind, UserId};
use crate::error::{GatewayError, GatewayResult};
use crate::llm::{LanguageModel, LlmClient};
use crate::orchestrator::QueryOrchestrator;
use crate::registry::AgentRegistry;
use crate::schema::{SchemaCache, SchemaSnapshot};
use crate::session::CloseReason;
use crate::status::StatusFanout;
use crate::store::{ConnectionRecord, Store, now_unix};

/// External collaborators injected at startup
pub struct Collaborators {
    /// Llm.
    pub llm: Arc<dyn LanguageModel>,
    /// Identity.
    pub identity: Arc<dyn IdentityProvider>,
    /// Blob.
    pub blob: Arc<dyn BlobStore>,
}

/// Everything a request handler needs, constructed once at startup
pub struct GatewayContext {
    /// Config.
    pub config: GatewayConfig,
    /// Store.
    pub store: Store,
    /// Correlator.
    pub correlator: Arc<Correlator>,
    /// Registry.
    pub registry: Arc<AgentRegistry>,
    /// Schema cache.
    pub schema_cache: Arc<SchemaCache>,
    /// Fanout.
    pub fanout: Arc<StatusFanout>,
    /// Csv pool.
    pub csv_pool: Arc<CsvSessionPool>,
    /// Orchestrator.
    pub orchestrator: QueryOrchestrator,
    /// Identity.
    pub identity: Arc<dyn IdentityProvider>,
    /// Blob.
    pub blob: Arc<dyn BlobStore>,
    llm: Arc<dyn LanguageModel>,
    shutdown: CancellationToken,
}

impl GatewayContext {
    /// Builds the context and starts the status-forwarding task.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or the application database
    /// cannot be opened/migrated.
    pub async fn new(
        config: GatewayConfig,
        collaborators: Collaborators,
    ) -> GatewayResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| GatewayError::internal(e.to_string()))?;
        let store = Store::connect(&config.database_url).await?;

        let correlator = Arc::new(Correlator::new());
        let registry = Arc::new(AgentRegistry::new(correlator.clone()));
        let schema_cache = Arc::new(SchemaCache::new());
        let fanout = Arc::new(StatusFanout::new(
            config.subscriber_queue_capacity.as_usize(),
        ));
        let csv_pool = Arc::new(CsvSessionPool::new(
            collaborators.blob.clone(),
            config.csv_source_cap,
            config.csv_session_cap,
            config.csv_pool_cap,
        ));
        let analytic = Arc::new(AnalyticCsvEngine::new(
            collaborators.blob.clone(),
            config.csv_source_cap,
        ));
        let orchestrator = QueryOrchestrator::new(
            store.clone(),
            registry.clone(),
            correlator.clone(),
            schema_cache.clone(),
            LlmClient::new(collaborators.llm.clone(), config.llm.timeout_ms.as_duration()),
            csv_pool.clone(),
            analytic,
            config.dispatch_timeout_ms.as_duration(),
            config.summary_sample_rows,
        );

        let shutdown = CancellationToken::new();
        tokio::spawn(
            fanout
                .clone()
                .run(registry.subscribe(), shutdown.child_token()),
        );

        Ok(Arc::new(Self {
            config,
            store,
            correlator,
            registry,
            schema_cache,
            fanout,
            csv_pool,
            orchestrator,
            identity: collaborators.identity,
            blob: collaborators.blob,
            llm: collaborators.llm,
            shutdown,
        }))
    }

    /// Verifies every downstream collaborator before traffic is accepted.
    ///
    /// # Errors
    ///
    /// Any unreachable collaborator fails startup; the caller treats this as
    /// fatal.
    pub async fn startup_checks(&self) -> GatewayResult<()> {
        self.store.ping().await?;
        self.identity.ping().await?;
        self.blob.ping().await?;
        self.llm.ping().await?;
        info!("startup checks passed");
        Ok(())
    }

    /// Whether shutdown has begun; new sessions and subscribers are refused
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token observed by the HTTP server for graceful shutdown
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops accepting work and disposes every component: pendings fail
    /// with `shutdown`, sessions and subscribers close, CSV sessions are
    /// released.
    pub fn shutdown(&self) {
        info!("gateway shutting down");
        self.shutdown.cancel();
        self.correlator.fail_all_shutdown();
        self.registry.close_all();
        self.fanout.close_all();
        self.csv_pool.clear();
    }

    /// Creates a Connection, returning the record and the one-time key
    ///
    /// # Errors
    ///
    /// Propagates store write failures.
    pub async fn create_connection(
        &self,
        owner: UserId,
        name: String,
        db_kind: DbKind,
    ) -> GatewayResult<(ConnectionRecord, AgentKey)> {
        let agent_key = AgentKey::generate();
        let record = ConnectionRecord {
            connection_id: ConnectionId::generate(),
            name,
            db_kind,
            owner: owner.clone(),
            agent_id: AgentId::generate(),
            agent_key_digest: agent_key.digest(),
            created_at: now_unix(),
        };
        self.store.create_connection(&record).await?;
        self.refresh_subscriber_ownership(&owner).await?;
        info!(connection_id = %record.connection_id, agent_id = %record.agent_id, "connection created");
        Ok((record, agent_key))
    }

    /// Deletes a Connection: evicts any live session, failing its pending
    /// correlations, drops the schema cache entry, removes the record, and
    /// prunes subscriber ownership sets.
    ///
    /// # Errors
    ///
    /// `not_found` when the Connection does not exist or belongs to another
    /// user.
    pub async fn delete_connection(
        &self,
        user: &UserId,
        connection_id: ConnectionId,
    ) -> GatewayResult<()> {
        let record = self.owned_connection(user, connection_id).await?;
        self.registry.evict(record.agent_id, CloseReason::Shutdown);
        self.schema_cache.remove(connection_id);
        self.store.delete_connection(connection_id).await?;
        self.refresh_subscriber_ownership(user).await?;
        info!(%connection_id, agent_id = %record.agent_id, "connection deleted");
        Ok(())
    }

    /// Loads a Connection and enforces ownership
    ///
    /// # Errors
    ///
    /// `not_found` for missing or foreign Connections.
    pub async fn owned_connection(
        &self,
        user: &UserId,
        connection_id: ConnectionId,
    ) -> GatewayResult<ConnectionRecord> {
        let record = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or(GatewayError::NotFound {
                entity: "connection",
            })?;
        if record.owner == *user {
            Ok(record)
        } else {
            Err(GatewayError::NotFound {
                entity: "connection",
            })
        }
    }

    /// Round-trips a schema refresh for an owned Connection
    ///
    /// # Errors
    ///
    /// `agent_unreachable` when no session is live; `timeout` when the agent
    /// does not answer in time.
    pub async fn refresh_schema(
        &self,
        user: &UserId,
        connection_id: ConnectionId,
    ) -> GatewayResult<SchemaSnapshot> {
        let record = self.owned_connection(user, connection_id).await?;
        let session = self
            .registry
            .lookup(record.agent_id)
            .ok_or(GatewayError::AgentUnreachable {
                agent_id: record.agent_id,
            })?;
        self.schema_cache
            .refresh(
                &self.correlator,
                &session,
                self.config.dispatch_timeout_ms.as_duration(),
            )
            .await
    }

    /// Recomputes the owned-agent capability set on every live subscriber
    /// for the user; called on Connection create/delete.
    ///
    /// # Errors
    ///
    /// Propagates store read failures.
    pub async fn refresh_subscriber_ownership(&self, user: &UserId) -> GatewayResult<()> {
        let owned: HashSet<AgentId> = self.store.owned_agent_ids(user).await?.into_iter().collect();
        self.fanout.refresh_ownership(user, &owned);
        Ok(())
    }
}
