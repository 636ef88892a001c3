//! Status Fan-out
//!
//! Delivers agent up/down transitions to subscribed UI observers. Each
//! subscriber only ever sees events for agents belonging to Connections its
//! user owns; the ownership set is captured at subscription time and
//! recomputed when Connections are created or deleted. Delivery is
//! best-effort: a subscriber whose queue is full is shed, so publishers
//! never block.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{AgentId, UserId};
use crate::registry::AgentStatusEvent;

/// Wire shape of one status message on the UI socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(rename = "type")]
    /// Kind.
    pub kind: String,
    /// Agent id.
    pub agent_id: AgentId,
    #[serde(rename = "agentConnected")]
    /// Agent connected.
    pub agent_connected: bool,
}

impl StatusUpdate {
    /// Builds the fixed-`type` update for one transition
    #[must_use]
    pub fn new(agent_id: AgentId, agent_connected: bool) -> Self {
        Self {
            kind: "AGENT_STATUS_UPDATE".to_string(),
            agent_id,
            agent_connected,
        }
    }
}

/// Opaque subscriber identity within the fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct SubscriberEntry {
    user: UserId,
    agents: Mutex<HashSet<AgentId>>,
    tx: mpsc::Sender<StatusUpdate>,
}

/// Ownership-filtered broadcast of agent status transitions
pub struct StatusFanout {
    subscribers: DashMap<SubscriberId, Arc<SubscriberEntry>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl StatusFanout {
    /// Creates an empty fan-out with the given per-subscriber queue bound
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    /// Current subscriber count
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Registers a subscriber and queues its initial snapshot.
    ///
    /// `owned_agents` is the capability set resolved at subscription time;
    /// `connected_now` is the registry snapshot used to seed the UI.
    #[must_use]
    pub fn subscribe(
        &self,
        user: UserId,
        owned_agents: HashSet<AgentId>,
        connected_now: &[AgentId],
    ) -> (SubscriberId, mpsc::Receiver<StatusUpdate>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        for agent_id in connected_now {
            if owned_agents.contains(agent_id) {
                let _ = tx.try_send(StatusUpdate::new(*agent_id, true));
            }
        }
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.insert(
            id,
            Arc::new(SubscriberEntry {
                user,
                agents: Mutex::new(owned_agents),
                tx,
            }),
        );
        (id, rx)
    }

    /// Removes a subscriber; its receiver sees end-of-stream
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }

    /// Delivers one transition to every entitled subscriber.
    ///
    /// Slow consumers are shed: a full queue removes the subscriber rather
    /// than ever blocking the publisher.
    pub fn publish(&self, event: AgentStatusEvent) {
        let update = StatusUpdate::new(event.agent_id, event.connected);
        let mut shed = Vec::new();
        for entry in &self.subscribers {
            let owns = entry
                .agents
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .contains(&event.agent_id);
            if !owns {
                continue;
            }
            match entry.tx.try_send(update.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(user = %entry.user, "shedding slow status subscriber");
                    shed.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    shed.push(*entry.key());
                }
            }
        }
        for id in shed {
            self.subscribers.remove(&id);
        }
    }

    /// Replaces the ownership set of every subscriber belonging to `user`;
    /// called when Connections are created or deleted.
    pub fn refresh_ownership(&self, user: &UserId, owned_agents: &HashSet<AgentId>) {
        for entry in &self.subscribers {
            if entry.user == *user {
                entry
                    .agents
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone_from(owned_agents);
            }
        }
    }

    /// Drops every subscriber; shutdown path
    pub fn close_all(&self) {
        self.subscribers.clear();
    }

    /// Forwards registry events into the fan-out until cancelled.
    ///
    /// Run as one background task; lagging on the broadcast channel only
    /// skips transitions, it never blocks the registry.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<AgentStatusEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                received = events.recv() => match received {
                    Ok(event) => self.publish(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "status fan-out lagged behind the registry");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }
}

/// Checks an `Origin` header against the configured allow-list.
///
/// Scheme and host compare case-insensitively; the effective port (filling
/// in 80/443 for http/https) must match exactly. A `*.` prefix in an allowed
/// entry matches any subdomain, never the apex.
#[must_use]
pub fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    let Some(origin) = parse_origin(origin) else {
        return false;
    };
    allowed.iter().any(|entry| {
        let Some(pattern) = parse_origin(entry) else {
            return false;
        };
        if pattern.scheme != origin.scheme || pattern.port != origin.port {
            return false;
        }
        if let Some(suffix) = pattern.host.strip_prefix("*.") {
            origin
                .host
                .strip_suffix(suffix)
                .is_some_and(|head| !head.is_empty() && head.ends_with('.'))
        } else {
            pattern.host == origin.host
        }
    })
}

struct ParsedOrigin {
    scheme: String,
    host: String,
    port: u16,
}

fn parse_origin(raw: &str) -> Option<ParsedOrigin> {
    let (scheme, rest) = raw.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return None;
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host, port.parse::<u16>().ok()?)
        }
        _ => {
            let default = match scheme.as_str() {
                "http" | "ws" => 80,
                "https" | "wss" => 443,
                _ => return None,
            };
            (rest, default)
        }
    };
    if host.is_empty() {
        return None;
    }
    Some(ParsedOrigin {
        scheme,
        host: host.to_ascii_lowercase(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserId {
        UserId::try_new(name.to_string()).unwrap()
    }

    #[test]
    fn update_wire_shape_is_the_frozen_one() {
        let agent_id = AgentId::generate();
        let json = serde_json::to_value(StatusUpdate::new(agent_id, true)).unwrap();
        assert_eq!(json["type"], "AGENT_STATUS_UPDATE");
        assert_eq!(json["agentConnected"], true);
        assert_eq!(json["agent_id"], agent_id.to_string());
    }

    #[tokio::test]
    async fn events_are_filtered_by_ownership() {
        let fanout = StatusFanout::new(8);
        let mine = AgentId::generate();
        let theirs = AgentId::generate();

        let (_id, mut rx) = fanout.subscribe(
            user("alice"),
            HashSet::from([mine]),
            &[],
        );

        fanout.publish(AgentStatusEvent { agent_id: theirs, connected: true });
        fanout.publish(AgentStatusEvent { agent_id: mine, connected: true });

        let update = rx.recv().await.unwrap();
        assert_eq!(update.agent_id, mine);
        assert!(rx.try_recv().is_err(), "foreign event must not be delivered");
    }

    #[tokio::test]
    async fn initial_snapshot_is_ownership_filtered() {
        let fanout = StatusFanout::new(8);
        let mine = AgentId::generate();
        let theirs = AgentId::generate();

        let (_id, mut rx) = fanout.subscribe(
            user("alice"),
            HashSet::from([mine]),
            &[mine, theirs],
        );
        let update = rx.recv().await.unwrap();
        assert_eq!(update.agent_id, mine);
        assert!(update.agent_connected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscribers_are_shed_not_blocked_on() {
        let fanout = StatusFanout::new(1);
        let agent = AgentId::generate();
        let (_id, _rx) = fanout.subscribe(user("alice"), HashSet::from([agent]), &[]);

        fanout.publish(AgentStatusEvent { agent_id: agent, connected: true });
        // Queue of one is now full; the next publish sheds the subscriber.
        fanout.publish(AgentStatusEvent { agent_id: agent, connected: false });
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn ownership_refresh_takes_effect_for_live_subscribers() {
        let fanout = StatusFanout::new(8);
        let agent = AgentId::generate();
        let alice = user("alice");
        let (_id, mut rx) = fanout.subscribe(alice.clone(), HashSet::new(), &[]);

        fanout.publish(AgentStatusEvent { agent_id: agent, connected: true });
        assert!(rx.try_recv().is_err());

        fanout.refresh_ownership(&alice, &HashSet::from([agent]));
        fanout.publish(AgentStatusEvent { agent_id: agent, connected: true });
        assert_eq!(rx.recv().await.unwrap().agent_id, agent);
    }

    #[test]
    fn origin_scheme_and_host_are_case_insensitive() {
        let allowed = ["https://app.example.com".to_string()];
        assert!(origin_allowed(&allowed, "HTTPS://App.Example.COM"));
        assert!(origin_allowed(&allowed, "https://app.example.com:443"));
        assert!(!origin_allowed(&allowed, "http://app.example.com"));
    }

    #[test]
    fn origin_port_must_match_exactly() {
        let allowed = ["http://localhost:3000".to_string()];
        assert!(origin_allowed(&allowed, "http://LOCALHOST:3000"));
        assert!(!origin_allowed(&allowed, "http://localhost:3001"));
        assert!(!origin_allowed(&allowed, "http://localhost"));
    }

    #[test]
    fn subdomain_wildcard_never_matches_the_apex() {
        let allowed = ["https://*.example.com".to_string()];
        assert!(origin_allowed(&allowed, "https://app.example.com"));
        assert!(origin_allowed(&allowed, "https://a.b.example.com"));
        assert!(!origin_allowed(&allowed, "https://example.com"));
        assert!(!origin_allowed(&allowed, "https://evilexample.com"));
    }

    #[test]
    fn garbage_origins_are_rejected() {
        let allowed = ["https://app.example.com".to_string()];
        assert!(!origin_allowed(&allowed, "app.example.com"));
        assert!(!origin_allowed(&allowed, ""));
        assert!(!origin_allowed(&allowed, "https://"));
    }
}
