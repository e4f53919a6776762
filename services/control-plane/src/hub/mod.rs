//! The agent connection hub.
//!
//! Owns one entry per currently-connected agent and exposes the outbound
//! send/command API consumed by deployment orchestration, the workflow
//! engine, and operator actions. All registries live inside one [`Hub`]
//! value constructed at process start and shared by handle; there is no
//! ambient global state.

mod commands;
pub mod reaper;
pub mod session;

pub use commands::CommandError;
pub use reaper::ConnectionReaper;

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use shipway_id::{OrgId, RequestId, ServerId};
use shipway_protocol::{CommandFrame, CommandResponse, CommandType, Dialect, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use commands::CommandCorrelator;

/// Default timeout for correlated commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// What the hub can push down a session's outbound channel.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A rendered wire frame.
    Text(String),

    /// Close the socket with a code; the session task sends the close frame
    /// and tears down.
    Close { code: u16, reason: &'static str },
}

/// Connection info exposed to operators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// One live agent connection.
struct ConnectedAgent {
    org_id: OrgId,
    agent_id: String,
    server_name: String,
    dialect: Dialect,
    session: Uuid,
    outbound: mpsc::UnboundedSender<Outbound>,
    last_heartbeat: DateTime<Utc>,
    connected_at: DateTime<Utc>,
}

struct HubInner {
    agents: RwLock<HashMap<ServerId, ConnectedAgent>>,
    correlator: CommandCorrelator,
}

/// The connection registry.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                agents: RwLock::new(HashMap::new()),
                correlator: CommandCorrelator::new(),
            }),
        }
    }

    /// Registers a freshly handshaken agent and returns its session ID.
    ///
    /// At most one entry exists per server: an existing entry is replaced
    /// and its socket asked to close. The replaced session's eventual
    /// disconnect will not evict the new entry (see [`Hub::deregister`]).
    pub(crate) fn register(
        &self,
        server_id: ServerId,
        org_id: OrgId,
        agent_id: String,
        server_name: String,
        dialect: Dialect,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Uuid {
        let session = Uuid::new_v4();
        let now = Utc::now();

        let agent = ConnectedAgent {
            org_id,
            agent_id,
            server_name,
            dialect,
            session,
            outbound,
            last_heartbeat: now,
            connected_at: now,
        };

        let replaced = self.inner.agents.write().unwrap().insert(server_id, agent);
        if let Some(old) = replaced {
            debug!(server_id = %server_id, "Replacing existing agent connection");
            let _ = old.outbound.send(Outbound::Close {
                code: 1000,
                reason: "replaced by a newer connection",
            });
        }

        session
    }

    /// Removes the agent entry, but only if it still belongs to the given
    /// session. A session that was replaced must not evict its successor.
    pub(crate) fn deregister(&self, server_id: ServerId, session: Uuid) -> bool {
        let mut agents = self.inner.agents.write().unwrap();
        match agents.get(&server_id) {
            Some(agent) if agent.session == session => {
                agents.remove(&server_id);
                true
            }
            _ => false,
        }
    }

    /// Refreshes the liveness timestamp for a server's connection.
    pub fn touch_heartbeat(&self, server_id: ServerId) -> bool {
        self.touch_heartbeat_at(server_id, Utc::now())
    }

    pub(crate) fn touch_heartbeat_at(&self, server_id: ServerId, at: DateTime<Utc>) -> bool {
        match self.inner.agents.write().unwrap().get_mut(&server_id) {
            Some(agent) => {
                agent.last_heartbeat = at;
                true
            }
            None => false,
        }
    }

    /// Whether an agent is currently connected for this server.
    pub fn is_agent_connected(&self, server_id: ServerId) -> bool {
        self.inner.agents.read().unwrap().contains_key(&server_id)
    }

    /// Live connection info for a server, if connected.
    pub fn agent_info(&self, server_id: ServerId) -> Option<AgentInfo> {
        self.inner
            .agents
            .read()
            .unwrap()
            .get(&server_id)
            .map(|agent| AgentInfo {
                agent_id: agent.agent_id.clone(),
                last_heartbeat: agent.last_heartbeat,
            })
    }

    /// All currently connected server IDs.
    pub fn connected_server_ids(&self) -> Vec<ServerId> {
        self.inner.agents.read().unwrap().keys().copied().collect()
    }

    /// Number of live connections.
    pub fn agent_count(&self) -> usize {
        self.inner.agents.read().unwrap().len()
    }

    /// Best-effort send. Returns false if the agent is not connected (or
    /// its session is tearing down).
    pub fn send_to_agent(&self, server_id: ServerId, message: &ServerMessage) -> bool {
        let agents = self.inner.agents.read().unwrap();
        let Some(agent) = agents.get(&server_id) else {
            return false;
        };

        let text = message.to_text(agent.dialect);
        agent.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Sends a correlated command and awaits the agent's response.
    ///
    /// Exactly one of three things happens: the call resolves with the
    /// response data, rejects with the agent-carried error, or rejects on
    /// timeout. The pending entry is removed on every path.
    pub async fn send_command(
        &self,
        server_id: ServerId,
        kind: CommandType,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CommandError> {
        let timeout = timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let request_id = RequestId::new().to_string();

        let rx = self.inner.correlator.register(&request_id);

        let frame = CommandFrame::new(kind, &request_id, payload);
        if !self.send_to_agent(server_id, &ServerMessage::Command(frame)) {
            // Never registered as a leak: reject immediately and clean up.
            self.inner.correlator.discard(&request_id);
            return Err(CommandError::NotConnected(server_id));
        }

        debug!(server_id = %server_id, command = %kind, request_id = %request_id, "Command sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.inner.correlator.discard(&request_id);
                Err(CommandError::ConnectionClosed)
            }
            Err(_) => {
                self.inner.correlator.discard(&request_id);
                warn!(server_id = %server_id, command = %kind, request_id = %request_id,
                    "Command timed out");
                Err(CommandError::Timeout(timeout))
            }
        }
    }

    /// Routes an inbound `command_response` to its pending caller. Returns
    /// false for unmatched or late responses.
    pub fn resolve_command(&self, response: CommandResponse) -> bool {
        self.inner.correlator.resolve(response)
    }

    /// Number of commands still awaiting a response.
    pub fn pending_command_count(&self) -> usize {
        self.inner.correlator.pending_len()
    }

    /// Agents whose last heartbeat is older than `max_age` at `now`.
    pub(crate) fn stale_agents(
        &self,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Vec<(ServerId, Uuid)> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        self.inner
            .agents
            .read()
            .unwrap()
            .iter()
            .filter(|(_, agent)| now - agent.last_heartbeat > max_age)
            .map(|(server_id, agent)| (*server_id, agent.session))
            .collect()
    }

    /// Force-closes a session and evicts it. Used by the stale reaper.
    pub(crate) fn evict(
        &self,
        server_id: ServerId,
        session: Uuid,
        code: u16,
        reason: &'static str,
    ) -> bool {
        let evicted = {
            let agents = self.inner.agents.read().unwrap();
            match agents.get(&server_id) {
                Some(agent) if agent.session == session => Some((
                    agent.outbound.clone(),
                    agent.org_id,
                    agent.server_name.clone(),
                )),
                _ => None,
            }
        };

        let Some((outbound, org_id, server_name)) = evicted else {
            return false;
        };

        warn!(
            server_id = %server_id,
            org_id = %org_id,
            server_name = %server_name,
            code,
            reason,
            "Force-closing agent connection"
        );
        let _ = outbound.send(Outbound::Close { code, reason });
        self.deregister(server_id, session)
    }

    /// How long the given server's agent has been connected.
    pub fn connected_since(&self, server_id: ServerId) -> Option<DateTime<Utc>> {
        self.inner
            .agents
            .read()
            .unwrap()
            .get(&server_id)
            .map(|agent| agent.connected_at)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register_fake(
        hub: &Hub,
        server_id: ServerId,
        dialect: Dialect,
    ) -> (Uuid, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = hub.register(
            server_id,
            OrgId::new(),
            "agent-test".to_string(),
            "server-test".to_string(),
            dialect,
            tx,
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_register_replaces_previous_connection() {
        let hub = Hub::new();
        let server_id = ServerId::new();

        let (old_session, mut old_rx) = register_fake(&hub, server_id, Dialect::Legacy);
        let (new_session, _new_rx) = register_fake(&hub, server_id, Dialect::Compact);

        assert_eq!(hub.agent_count(), 1);

        // Old socket was asked to close.
        let Some(Outbound::Close { code, .. }) = old_rx.recv().await else {
            panic!("expected close for replaced connection");
        };
        assert_eq!(code, 1000);

        // The replaced session's disconnect must not evict the new entry.
        assert!(!hub.deregister(server_id, old_session));
        assert!(hub.is_agent_connected(server_id));
        assert!(hub.deregister(server_id, new_session));
        assert!(!hub.is_agent_connected(server_id));
    }

    #[tokio::test]
    async fn test_send_to_agent_renders_dialect() {
        let hub = Hub::new();
        let legacy_id = ServerId::new();
        let compact_id = ServerId::new();
        let (_s1, mut legacy_rx) = register_fake(&hub, legacy_id, Dialect::Legacy);
        let (_s2, mut compact_rx) = register_fake(&hub, compact_id, Dialect::Compact);

        assert!(hub.send_to_agent(legacy_id, &ServerMessage::HeartbeatAck));
        assert!(hub.send_to_agent(compact_id, &ServerMessage::HeartbeatAck));

        let Some(Outbound::Text(legacy)) = legacy_rx.recv().await else {
            panic!("expected text");
        };
        let Some(Outbound::Text(compact)) = compact_rx.recv().await else {
            panic!("expected text");
        };

        let legacy: Value = serde_json::from_str(&legacy).unwrap();
        let compact: Value = serde_json::from_str(&compact).unwrap();
        assert_eq!(legacy["type"], "heartbeat_ack");
        assert_eq!(compact["type"], "Pong");
    }

    #[tokio::test]
    async fn test_send_to_agent_not_connected() {
        let hub = Hub::new();
        assert!(!hub.send_to_agent(ServerId::new(), &ServerMessage::HeartbeatAck));
    }

    #[tokio::test]
    async fn test_send_command_resolves_on_response() {
        let hub = Hub::new();
        let server_id = ServerId::new();
        let (_session, mut rx) = register_fake(&hub, server_id, Dialect::Legacy);

        let hub2 = hub.clone();
        let responder = tokio::spawn(async move {
            let Some(Outbound::Text(text)) = rx.recv().await else {
                panic!("expected command frame");
            };
            let frame: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(frame["type"], "scale");
            assert_eq!(frame["payload"]["replicas"], 3);
            let request_id = frame["payload"]["request_id"].as_str().unwrap().to_string();

            hub2.resolve_command(CommandResponse {
                request_id,
                success: true,
                data: Some(json!({"scaled": true})),
                error: None,
            });
        });

        let data = hub
            .send_command(server_id, CommandType::Scale, json!({"replicas": 3}), None)
            .await
            .unwrap();
        assert_eq!(data["scaled"], true);
        assert_eq!(hub.pending_command_count(), 0);

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_command_rejects_when_not_connected() {
        let hub = Hub::new();
        let server_id = ServerId::new();

        let err = hub
            .send_command(server_id, CommandType::Ping, Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotConnected(id) if id == server_id));
        assert_eq!(hub.pending_command_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_times_out_and_cleans_up() {
        let hub = Hub::new();
        let server_id = ServerId::new();
        let (_session, _rx) = register_fake(&hub, server_id, Dialect::Legacy);

        let err = hub
            .send_command(
                server_id,
                CommandType::Ping,
                Value::Null,
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Timeout(_)));
        assert_eq!(hub.pending_command_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_commands_settle_independently() {
        let hub = Hub::new();
        let fast_id = ServerId::new();
        let slow_id = ServerId::new();
        let (_s1, mut fast_rx) = register_fake(&hub, fast_id, Dialect::Legacy);
        let (_s2, _slow_rx) = register_fake(&hub, slow_id, Dialect::Legacy);

        let hub2 = hub.clone();
        tokio::spawn(async move {
            let Some(Outbound::Text(text)) = fast_rx.recv().await else {
                return;
            };
            let frame: Value = serde_json::from_str(&text).unwrap();
            let request_id = frame["payload"]["request_id"].as_str().unwrap().to_string();
            hub2.resolve_command(CommandResponse {
                request_id,
                success: true,
                data: None,
                error: None,
            });
        });

        let fast = hub.send_command(fast_id, CommandType::Ping, Value::Null, None);
        let slow = hub.send_command(
            slow_id,
            CommandType::Ping,
            Value::Null,
            Some(Duration::from_secs(1)),
        );

        let (fast, slow) = tokio::join!(fast, slow);
        assert!(fast.is_ok());
        assert!(matches!(slow.unwrap_err(), CommandError::Timeout(_)));
        assert_eq!(hub.pending_command_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_agents_and_evict() {
        let hub = Hub::new();
        let server_id = ServerId::new();
        let (session, mut rx) = register_fake(&hub, server_id, Dialect::Legacy);

        let stale_at = Utc::now() - chrono::Duration::seconds(95);
        assert!(hub.touch_heartbeat_at(server_id, stale_at));

        let stale = hub.stale_agents(Duration::from_secs(90), Utc::now());
        assert_eq!(stale, vec![(server_id, session)]);

        assert!(hub.evict(server_id, session, 4004, "heartbeat timeout"));
        assert!(!hub.is_agent_connected(server_id));

        let Some(Outbound::Close { code, .. }) = rx.recv().await else {
            panic!("expected close");
        };
        assert_eq!(code, 4004);
    }

    #[tokio::test]
    async fn test_fresh_agent_is_not_stale() {
        let hub = Hub::new();
        let server_id = ServerId::new();
        let (_session, _rx) = register_fake(&hub, server_id, Dialect::Legacy);

        assert!(hub
            .stale_agents(Duration::from_secs(90), Utc::now())
            .is_empty());
    }
}
