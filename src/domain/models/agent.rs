//! Remote-agent session and command models, plus the wire protocol spoken
//! over the duplex agent channel.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A live agent session on this control-plane node. Keyed by socket id;
/// at most one session exists per connector.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub socket_id: String,
    pub tenant_id: String,
    pub connector_id: String,
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Latest schema pushed by the agent via `schema:discovered`.
    pub schema: Option<serde_json::Value>,
    /// System metrics piggybacked on heartbeats.
    pub metrics: Option<AgentMetrics>,
}

impl AgentSession {
    /// A session goes stale when no heartbeat arrived within the timeout.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat > timeout
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentMetrics {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub uptime: Option<u64>,
}

/// Delivery state of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Completed,
    Failed,
}

/// A command tracked by the gateway until it completes, times out, or is
/// retired after max retries. The response waiter lives in the gateway's
/// waiter registry, not here.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command_id: String,
    pub tenant_id: String,
    pub connector_id: Option<String>,
    pub verb: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: CommandStatus,
}

/// A command recorded while no agent session was available; drained FIFO
/// when a session for the tenant reappears.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command_id: String,
    pub connector_id: Option<String>,
    pub verb: String,
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

/// The command frame sent to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command_id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    pub operation: String,
    pub payload: serde_json::Value,
}

/// Messages an agent sends to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum AgentToGateway {
    /// Authentication handshake, first message on every connection.
    #[serde(rename = "auth")]
    Auth {
        #[serde(rename = "apiKey")]
        api_key: String,
    },

    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatPayload),

    #[serde(rename = "command:response")]
    CommandResponse {
        #[serde(rename = "commandId")]
        command_id: String,
        response: serde_json::Value,
    },

    #[serde(rename = "schema:discovered")]
    SchemaDiscovered { schema: serde_json::Value },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatPayload {
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metrics: AgentMetrics,
}

/// Messages the gateway sends to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum GatewayToAgent {
    #[serde(rename = "authenticated")]
    Authenticated {
        status: String,
        #[serde(rename = "tenantId")]
        tenant_id: String,
        #[serde(rename = "connectorId")]
        connector_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "command")]
    Command(CommandEnvelope),
}

/// Parse the tenant id out of a `vmc_<tenantId>_<opaque1>_<opaque2>` key.
///
/// The third and fourth fields are opaque; only the shape and prefix are
/// checked here. Ownership is proven by a bcrypt match downstream.
pub fn parse_api_key_tenant(api_key: &str) -> Option<&str> {
    let mut parts = api_key.split('_');
    if parts.next() != Some("vmc") {
        return None;
    }
    let tenant = parts.next().filter(|t| !t.is_empty())?;
    // Exactly four fields, none empty.
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => Some(tenant),
        _ => None,
    }
}
