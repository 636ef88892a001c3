//! Agent Registry
//!
//! Process-wide mapping from `agent_id` to the live session's send handle.
//! The registry allocates session epochs, enforces the single-session
//! invariant by displacing prior sessions, fails displaced/detached pendings
//! through the correlator before returning, and emits up/down events.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::correlator::Correlator;
use crate::domain::{AgentId, ConnectionId, SessionEpoch};
use crate::protocol::Frame;
use crate::session::{CloseReason, SessionHandle};

/// One agent up/down transition, published to the status fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStatusEvent {
    /// Agent id.
    pub agent_id: AgentId,
    /// Connected.
    pub connected: bool,
}

/// Live-session registry keyed by `agent_id`
pub struct AgentRegistry {
    sessions: DashMap<AgentId, SessionHandle>,
    epochs: DashMap<AgentId, u64>,
    correlator: Arc<Correlator>,
    events: broadcast::Sender<AgentStatusEvent>,
}

impl AgentRegistry {
    /// Creates an empty registry wired to the given correlator
    #[must_use]
    pub fn new(correlator: Arc<Correlator>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            sessions: DashMap::new(),
            epochs: DashMap::new(),
            correlator,
            events,
        }
    }

    /// Subscribes to up/down events; the receiver sees only transitions that
    /// happen after this call (pair with [`Self::snapshot`] for the initial
    /// picture).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AgentStatusEvent> {
        self.events.subscribe()
    }

    /// Attaches a freshly authenticated session, allocating its epoch.
    ///
    /// If a prior session exists it is displaced: closed with reason
    /// `superseded` and every pending request targeted at it failed with
    /// `agent_unreachable` before this method returns. In-flight work is not
    /// migrated; the new session starts empty.
    #[must_use]
    pub fn attach(
        &self,
        agent_id: AgentId,
        connection_id: ConnectionId,
        queue_capacity: usize,
    ) -> (SessionHandle, mpsc::Receiver<Frame>) {
        let epoch = {
            let mut counter = self.epochs.entry(agent_id).or_insert(0);
            *counter += 1;
            SessionEpoch::new(*counter)
        };
        let (handle, outbound_rx) =
            SessionHandle::new(agent_id, connection_id, epoch, queue_capacity);

        let displaced = match self.sessions.entry(agent_id) {
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                None
            }
            Entry::Occupied(mut slot) => {
                if slot.get().epoch() < epoch {
                    Some(slot.insert(handle.clone()))
                } else {
                    // Lost the race against an even newer handshake: this
                    // session is superseded before it ever went live.
                    handle.close(CloseReason::Superseded);
                    None
                }
            }
        };
        if let Some(old) = displaced {
            info!(%agent_id, old_epoch = %old.epoch(), new_epoch = %epoch, "displacing prior session");
            old.close(CloseReason::Superseded);
            self.correlator.fail_session(agent_id, old.epoch());
        }

        if !handle.is_closed() {
            let _ = self.events.send(AgentStatusEvent {
                agent_id,
                connected: true,
            });
        }
        (handle, outbound_rx)
    }

    /// Detaches a session if it is still the current one for its agent.
    ///
    /// A stale epoch (the session was already displaced) is a no-op. A real
    /// detach fails the session's pending requests before returning and
    /// emits `agent_down`.
    pub fn detach(&self, agent_id: AgentId, epoch: SessionEpoch) {
        let removed = self
            .sessions
            .remove_if(&agent_id, |_, session| session.epoch() == epoch);
        match removed {
            Some((_, session)) => {
                if !session.is_closed() {
                    session.close(CloseReason::TransportClosed);
                }
                self.correlator.fail_session(agent_id, epoch);
                let _ = self.events.send(AgentStatusEvent {
                    agent_id,
                    connected: false,
                });
                info!(%agent_id, %epoch, "agent session removed");
            }
            None => {
                debug!(%agent_id, %epoch, "detach ignored: not the current session");
            }
        }
    }

    /// Send handle of the live session for an agent, if any
    #[must_use]
    pub fn lookup(&self, agent_id: AgentId) -> Option<SessionHandle> {
        self.sessions
            .get(&agent_id)
            .map(|entry| entry.value().clone())
    }

    /// Whether an agent currently has a live session
    #[must_use]
    pub fn is_connected(&self, agent_id: AgentId) -> bool {
        self.sessions.contains_key(&agent_id)
    }

    /// All currently connected agents
    #[must_use]
    pub fn snapshot(&self) -> Vec<AgentId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Evicts the live session for an agent regardless of epoch.
    ///
    /// Used by Connection deletion and shutdown; pendings are failed before
    /// this returns.
    pub fn evict(&self, agent_id: AgentId, reason: CloseReason) {
        if let Some((_, session)) = self.sessions.remove(&agent_id) {
            let epoch = session.epoch();
            session.close(reason);
            self.correlator.fail_session(agent_id, epoch);
            let _ = self.events.send(AgentStatusEvent {
                agent_id,
                connected: false,
            });
            info!(%agent_id, %epoch, reason = reason.as_str(), "agent session evicted");
        }
    }

    /// Closes every live session with reason `shutdown`
    pub fn close_all(&self) {
        let agents = self.snapshot();
        for agent_id in agents {
            self.evict(agent_id, CloseReason::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::RequestPayload;
    use crate::error::GatewayError;
    use std::time::Duration;

    fn registry() -> (Arc<AgentRegistry>, Arc<Correlator>) {
        let correlator = Arc::new(Correlator::new());
        (Arc::new(AgentRegistry::new(correlator.clone())), correlator)
    }

    #[tokio::test]
    async fn at_most_one_live_session_per_agent() {
        let (registry, _) = registry();
        let agent_id = AgentId::generate();
        let connection_id = ConnectionId::generate();

        let (first, _rx1) = registry.attach(agent_id, connection_id, 8);
        let (second, _rx2) = registry.attach(agent_id, connection_id, 8);

        assert!(first.is_closed());
        assert_eq!(first.close_reason(), Some(CloseReason::Superseded));
        assert!(!second.is_closed());
        assert!(second.epoch() > first.epoch());

        let current = registry.lookup(agent_id).unwrap();
        assert_eq!(current.epoch(), second.epoch());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn displacement_fails_pending_requests_with_agent_unreachable() {
        let (registry, correlator) = registry();
        let agent_id = AgentId::generate();
        let connection_id = ConnectionId::generate();

        let (first, _rx1) = registry.attach(agent_id, connection_id, 8);
        let dispatch = {
            let correlator = correlator.clone();
            let session = first.clone();
            tokio::spawn(async move {
                correlator
                    .dispatch(&session, RequestPayload::SchemaRefresh, Duration::from_secs(30))
                    .await
            })
        };
        while correlator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let (_second, _rx2) = registry.attach(agent_id, connection_id, 8);
        let result = dispatch.await.unwrap();
        assert!(matches!(result, Err(GatewayError::AgentUnreachable { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn stale_detach_is_a_no_op() {
        let (registry, _) = registry();
        let agent_id = AgentId::generate();
        let connection_id = ConnectionId::generate();

        let (first, _rx1) = registry.attach(agent_id, connection_id, 8);
        let (second, _rx2) = registry.attach(agent_id, connection_id, 8);

        registry.detach(agent_id, first.epoch());
        assert!(registry.is_connected(agent_id));

        registry.detach(agent_id, second.epoch());
        assert!(!registry.is_connected(agent_id));
    }

    #[tokio::test]
    async fn attach_and_detach_emit_ordered_events() {
        let (registry, _) = registry();
        let mut events = registry.subscribe();
        let agent_id = AgentId::generate();
        let connection_id = ConnectionId::generate();

        let (handle, _rx) = registry.attach(agent_id, connection_id, 8);
        registry.detach(agent_id, handle.epoch());

        let up = events.recv().await.unwrap();
        assert_eq!(up, AgentStatusEvent { agent_id, connected: true });
        let down = events.recv().await.unwrap();
        assert_eq!(down, AgentStatusEvent { agent_id, connected: false });
    }

    #[tokio::test]
    async fn epochs_keep_increasing_across_reconnects() {
        let (registry, _) = registry();
        let agent_id = AgentId::generate();
        let connection_id = ConnectionId::generate();

        let (first, _r1) = registry.attach(agent_id, connection_id, 8);
        registry.detach(agent_id, first.epoch());
        let (second, _r2) = registry.attach(agent_id, connection_id, 8);

        assert!(second.epoch() > first.epoch());
    }
}
