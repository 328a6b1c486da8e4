//! Remote-agent gateway: authenticated sessions, heartbeat liveness,
//! command dispatch with request/response correlation, offline queuing,
//! and delivery retry.
//!
//! The session table and pending-command table are process-local; a
//! tenant's agent session lives on exactly one control-plane node.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::GatewayError;
use crate::domain::models::{
    parse_api_key_tenant, AgentSession, CommandEnvelope, CommandStatus, ConnectorType,
    GatewayConfig, GatewayToAgent, HeartbeatPayload, PendingCommand, QueuedCommand,
};
use crate::domain::ports::ConnectorStore;

/// Tuning knobs, converted from the loaded `GatewayConfig`.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub response_timeout: Duration,
}

impl From<&GatewayConfig> for GatewaySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            response_timeout: Duration::from_secs(config.response_timeout_secs),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

/// Execution context stamped onto a command frame; defaults to the command
/// id when a command is dispatched outside any execution.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub execution_id: Option<String>,
    pub activity_id: Option<String>,
}

/// Result of a dispatch attempt. `success=false` means the command was
/// recorded on the offline queue; the id is valid either way.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    pub command_id: String,
}

/// Gateway counters for observability.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub sessions: usize,
    pub pending_commands: usize,
    pub offline_queued: usize,
}

struct SessionEntry {
    session: AgentSession,
    outbound: mpsc::Sender<GatewayToAgent>,
}

pub struct AgentGateway {
    connectors: Arc<dyn ConnectorStore>,
    settings: GatewaySettings,
    /// socket id -> live session.
    sessions: DashMap<String, SessionEntry>,
    /// connector id -> socket id; enforces one session per connector.
    by_connector: DashMap<String, String>,
    /// Short-held maps; no awaits occur while locked.
    pending: Mutex<HashMap<String, PendingCommand>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
    offline: Mutex<HashMap<String, VecDeque<QueuedCommand>>>,
}

impl AgentGateway {
    pub fn new(connectors: Arc<dyn ConnectorStore>, settings: GatewaySettings) -> Self {
        Self {
            connectors,
            settings,
            sessions: DashMap::new(),
            by_connector: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            offline: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Authenticate a connecting agent and record its session.
    ///
    /// The key's prefix names the tenant; ownership is proven by a bcrypt
    /// match against one of the tenant's MINI connectors. Rejects duplicate
    /// sessions for the same connector.
    #[instrument(skip(self, api_key, outbound))]
    pub async fn register(
        &self,
        socket_id: &str,
        api_key: &str,
        remote_address: Option<String>,
        user_agent: Option<String>,
        outbound: mpsc::Sender<GatewayToAgent>,
    ) -> Result<AgentSession, GatewayError> {
        let tenant_id =
            parse_api_key_tenant(api_key).ok_or(GatewayError::MalformedApiKey)?.to_string();

        let candidates = self
            .connectors
            .connectors_for_tenant(&tenant_id, ConnectorType::Mini)
            .await
            .map_err(|_| GatewayError::AuthenticationFailed(tenant_id.clone()))?;

        let connector = candidates
            .iter()
            .find(|c| bcrypt::verify(api_key, &c.api_key_hash).unwrap_or(false))
            .ok_or_else(|| GatewayError::AuthenticationFailed(tenant_id.clone()))?;

        if self.by_connector.contains_key(&connector.id) {
            return Err(GatewayError::DuplicateSession(connector.id.clone()));
        }

        let now = Utc::now();
        let session = AgentSession {
            socket_id: socket_id.to_string(),
            tenant_id: tenant_id.clone(),
            connector_id: connector.id.clone(),
            remote_address,
            user_agent,
            connected_at: now,
            last_heartbeat: now,
            schema: None,
            metrics: None,
        };

        self.by_connector.insert(connector.id.clone(), socket_id.to_string());
        self.sessions.insert(
            socket_id.to_string(),
            SessionEntry { session: session.clone(), outbound: outbound.clone() },
        );

        info!(tenant_id, connector_id = %connector.id, socket_id, "agent session registered");

        let _ = outbound
            .send(GatewayToAgent::Authenticated {
                status: "ok".to_string(),
                tenant_id: tenant_id.clone(),
                connector_id: connector.id.clone(),
                timestamp: now,
            })
            .await;

        self.drain_offline(&tenant_id).await;

        Ok(session)
    }

    /// Remove a session on peer disconnect.
    pub fn disconnect(&self, socket_id: &str) {
        if let Some((_, entry)) = self.sessions.remove(socket_id) {
            self.by_connector.remove(&entry.session.connector_id);
            info!(
                tenant_id = %entry.session.tenant_id,
                connector_id = %entry.session.connector_id,
                "agent session removed"
            );
        }
    }

    /// Record a heartbeat, piggybacking any reported system metrics.
    pub fn heartbeat(&self, socket_id: &str, payload: &HeartbeatPayload) {
        if let Some(mut entry) = self.sessions.get_mut(socket_id) {
            entry.session.last_heartbeat = Utc::now();
            entry.session.metrics = Some(payload.metrics);
        }
    }

    /// Cache the latest schema pushed by the agent.
    pub fn schema_discovered(&self, socket_id: &str, schema: serde_json::Value) {
        if let Some(mut entry) = self.sessions.get_mut(socket_id) {
            entry.session.schema = Some(schema);
        }
    }

    pub fn session_for_connector(&self, connector_id: &str) -> Option<AgentSession> {
        let socket_id = self.by_connector.get(connector_id)?.clone();
        self.sessions.get(&socket_id).map(|e| e.session.clone())
    }

    pub fn session_schema(&self, connector_id: &str) -> Option<serde_json::Value> {
        self.session_for_connector(connector_id).and_then(|s| s.schema)
    }

    // ========================================================================
    // Command dispatch and correlation
    // ========================================================================

    /// Dispatch a command to the tenant's agent, or record it offline when
    /// no session is available.
    pub async fn dispatch_command(
        &self,
        tenant_id: &str,
        verb: &str,
        payload: serde_json::Value,
        connector_id: Option<&str>,
        context: CommandContext,
    ) -> DispatchOutcome {
        let command_id = new_command_id(verb);
        self.dispatch_with_id(command_id, tenant_id, verb, payload, connector_id, context).await
    }

    async fn dispatch_with_id(
        &self,
        command_id: String,
        tenant_id: &str,
        verb: &str,
        payload: serde_json::Value,
        connector_id: Option<&str>,
        context: CommandContext,
    ) -> DispatchOutcome {
        let Some((socket_id, outbound)) = self.select_session(tenant_id, connector_id) else {
            debug!(tenant_id, command_id, "no session; queuing command offline");
            self.offline.lock().expect("offline lock").entry(tenant_id.to_string()).or_default().push_back(
                QueuedCommand {
                    command_id: command_id.clone(),
                    connector_id: connector_id.map(str::to_string),
                    verb: verb.to_string(),
                    payload: payload.clone(),
                    queued_at: Utc::now(),
                },
            );
            self.track(PendingCommand {
                command_id: command_id.clone(),
                tenant_id: tenant_id.to_string(),
                connector_id: connector_id.map(str::to_string),
                verb: verb.to_string(),
                payload,
                created_at: Utc::now(),
                attempts: 0,
                status: CommandStatus::Pending,
            });
            return DispatchOutcome { success: false, command_id };
        };

        let envelope = CommandEnvelope {
            command_id: command_id.clone(),
            execution_id: context.execution_id.clone().unwrap_or_else(|| command_id.clone()),
            activity_id: context.activity_id.clone(),
            operation: verb.to_string(),
            payload: payload.clone(),
        };

        let sent = outbound.send(GatewayToAgent::Command(envelope)).await.is_ok();
        if !sent {
            // The channel died under us; treat like a missing session.
            warn!(tenant_id, command_id, socket_id, "send failed; queuing command offline");
            self.disconnect(&socket_id);
            self.offline.lock().expect("offline lock").entry(tenant_id.to_string()).or_default().push_back(
                QueuedCommand {
                    command_id: command_id.clone(),
                    connector_id: connector_id.map(str::to_string),
                    verb: verb.to_string(),
                    payload: payload.clone(),
                    queued_at: Utc::now(),
                },
            );
        }

        self.track(PendingCommand {
            command_id: command_id.clone(),
            tenant_id: tenant_id.to_string(),
            connector_id: connector_id.map(str::to_string),
            verb: verb.to_string(),
            payload,
            created_at: Utc::now(),
            attempts: u32::from(sent),
            status: if sent { CommandStatus::Sent } else { CommandStatus::Pending },
        });

        DispatchOutcome { success: sent, command_id }
    }

    /// Dispatch and await the correlated `command:response`.
    ///
    /// The waiter is installed up front so a command parked on the offline
    /// queue can still complete within the timeout window once an agent
    /// reconnects and the queue drains.
    #[instrument(skip(self, payload, context))]
    pub async fn dispatch_and_wait(
        &self,
        tenant_id: &str,
        verb: &str,
        payload: serde_json::Value,
        connector_id: Option<&str>,
        context: CommandContext,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, GatewayError> {
        let timeout = timeout.unwrap_or(self.settings.response_timeout);

        // Install the waiter before the frame can possibly be answered.
        let command_id = new_command_id(verb);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("waiters lock").insert(command_id.clone(), tx);

        let outcome = self
            .dispatch_with_id(command_id, tenant_id, verb, payload, connector_id, context)
            .await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without a response; treat as timeout.
            Ok(Err(_)) => Err(GatewayError::CommandTimeout),
            Err(_) => {
                self.waiters.lock().expect("waiters lock").remove(&outcome.command_id);
                debug!(command_id = %outcome.command_id, "command timed out");
                Err(GatewayError::CommandTimeout)
            }
        }
    }

    /// Inbound `command:response`: resolve the waiter (at most once) and
    /// mark the pending command completed. Late responses with no waiter
    /// are recorded but otherwise ignored.
    pub fn handle_response(&self, command_id: &str, response: serde_json::Value) {
        {
            let mut pending = self.pending.lock().expect("pending lock");
            if let Some(command) = pending.get_mut(command_id) {
                command.status = CommandStatus::Completed;
            }
        }

        let waiter = self.waiters.lock().expect("waiters lock").remove(command_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(command_id, "response arrived with no waiter installed"),
        }
    }

    /// Look up a tracked command, including failed ones.
    pub fn pending_command(&self, command_id: &str) -> Option<PendingCommand> {
        self.pending.lock().expect("pending lock").get(command_id).cloned()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            sessions: self.sessions.len(),
            pending_commands: self.pending.lock().expect("pending lock").len(),
            offline_queued: self
                .offline
                .lock()
                .expect("offline lock")
                .values()
                .map(VecDeque::len)
                .sum(),
        }
    }

    // ========================================================================
    // Background sweepers
    // ========================================================================

    /// Spawn the heartbeat and retry sweepers on their fixed interval.
    pub fn spawn_sweepers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let gateway = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(gateway.settings.sweep_interval);
                loop {
                    tick.tick().await;
                    gateway.sweep_sessions_once();
                }
            })
        };

        let retry = {
            let gateway = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(gateway.settings.sweep_interval);
                loop {
                    tick.tick().await;
                    gateway.sweep_pending_once().await;
                }
            })
        };

        vec![heartbeat, retry]
    }

    /// Remove sessions whose last heartbeat is older than the timeout.
    pub fn sweep_sessions_once(&self) {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.settings.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));

        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().session.is_stale(now, timeout))
            .map(|e| e.key().clone())
            .collect();

        for socket_id in stale {
            warn!(socket_id, "removing stale agent session");
            self.disconnect(&socket_id);
        }
    }

    /// Re-dispatch overdue commands with linear backoff; retire commands
    /// that exhausted their retries.
    pub async fn sweep_pending_once(&self) {
        let now = Utc::now();
        let retry_delay = self.settings.retry_delay.as_millis() as i64;

        let (due, exhausted): (Vec<PendingCommand>, Vec<String>) = {
            let mut pending = self.pending.lock().expect("pending lock");
            let mut due = Vec::new();
            let mut exhausted = Vec::new();
            for command in pending.values_mut() {
                if !matches!(command.status, CommandStatus::Pending | CommandStatus::Sent) {
                    continue;
                }
                if command.attempts >= self.settings.max_retries {
                    command.status = CommandStatus::Failed;
                    exhausted.push(command.command_id.clone());
                    continue;
                }
                let overdue = (now - command.created_at).num_milliseconds()
                    > i64::from(command.attempts) * retry_delay;
                if overdue {
                    due.push(command.clone());
                }
            }
            (due, exhausted)
        };

        for command_id in exhausted {
            warn!(command_id, "command exhausted delivery retries");
        }

        for command in due {
            self.redispatch(&command).await;
        }
    }

    async fn redispatch(&self, command: &PendingCommand) {
        let Some((_, outbound)) =
            self.select_session(&command.tenant_id, command.connector_id.as_deref())
        else {
            return;
        };

        let envelope = CommandEnvelope {
            command_id: command.command_id.clone(),
            execution_id: command.command_id.clone(),
            activity_id: None,
            operation: command.verb.clone(),
            payload: command.payload.clone(),
        };

        if outbound.send(GatewayToAgent::Command(envelope)).await.is_ok() {
            let mut pending = self.pending.lock().expect("pending lock");
            if let Some(entry) = pending.get_mut(&command.command_id) {
                entry.attempts += 1;
                entry.status = CommandStatus::Sent;
            }
            debug!(command_id = %command.command_id, "re-dispatched command");
        }
    }

    /// Deliver every command queued while the tenant had no session.
    /// Commands that still cannot be delivered return to the queue.
    async fn drain_offline(&self, tenant_id: &str) {
        let queued = self
            .offline
            .lock()
            .expect("offline lock")
            .get_mut(tenant_id)
            .map(std::mem::take)
            .unwrap_or_default();

        if queued.is_empty() {
            return;
        }
        info!(tenant_id, count = queued.len(), "draining offline command queue");

        for command in queued {
            let Some((_, outbound)) =
                self.select_session(tenant_id, command.connector_id.as_deref())
            else {
                self.offline
                    .lock()
                    .expect("offline lock")
                    .entry(tenant_id.to_string())
                    .or_default()
                    .push_back(command);
                continue;
            };

            let envelope = CommandEnvelope {
                command_id: command.command_id.clone(),
                execution_id: command.command_id.clone(),
                activity_id: None,
                operation: command.verb.clone(),
                payload: command.payload.clone(),
            };

            if outbound.send(GatewayToAgent::Command(envelope)).await.is_ok() {
                let mut pending = self.pending.lock().expect("pending lock");
                if let Some(entry) = pending.get_mut(&command.command_id) {
                    entry.attempts += 1;
                    entry.status = CommandStatus::Sent;
                }
            } else {
                self.offline
                    .lock()
                    .expect("offline lock")
                    .entry(tenant_id.to_string())
                    .or_default()
                    .push_back(command);
            }
        }
    }

    fn select_session(
        &self,
        tenant_id: &str,
        connector_id: Option<&str>,
    ) -> Option<(String, mpsc::Sender<GatewayToAgent>)> {
        if let Some(connector_id) = connector_id {
            let socket_id = self.by_connector.get(connector_id)?.clone();
            let entry = self.sessions.get(&socket_id)?;
            if entry.session.tenant_id != tenant_id {
                return None;
            }
            return Some((socket_id, entry.outbound.clone()));
        }

        self.sessions
            .iter()
            .find(|e| e.value().session.tenant_id == tenant_id)
            .map(|e| (e.key().clone(), e.value().outbound.clone()))
    }

    fn track(&self, command: PendingCommand) {
        self.pending.lock().expect("pending lock").insert(command.command_id.clone(), command);
    }
}

fn new_command_id(verb: &str) -> String {
    let rand = Uuid::new_v4().simple().to_string();
    format!("{verb}_{}_{}", Utc::now().timestamp_millis(), &rand[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{DomainError, DomainResult};
    use crate::domain::models::{AggregatorInstance, Connector, FieldMapping};
    use async_trait::async_trait;
    use serde_json::json;

    struct FakeConnectorStore {
        connectors: Vec<Connector>,
    }

    #[async_trait]
    impl ConnectorStore for FakeConnectorStore {
        async fn aggregator_instance_get(
            &self,
            id: &str,
            _tenant_id: &str,
        ) -> DomainResult<AggregatorInstance> {
            Err(DomainError::InstanceNotFound(id.to_string()))
        }

        async fn field_mapping_get(&self, id: &str, _tenant_id: &str) -> DomainResult<FieldMapping> {
            Err(DomainError::MappingNotFound(id.to_string()))
        }

        async fn connectors_for_tenant(
            &self,
            tenant_id: &str,
            connector_type: ConnectorType,
        ) -> DomainResult<Vec<Connector>> {
            Ok(self
                .connectors
                .iter()
                .filter(|c| c.tenant_id == tenant_id && c.connector_type == connector_type)
                .cloned()
                .collect())
        }
    }

    const API_KEY: &str = "vmc_acme_key1_s3cret";

    fn gateway_with_connector() -> Arc<AgentGateway> {
        // Minimum cost keeps the hash cheap for tests.
        let hash = bcrypt::hash(API_KEY, 4).unwrap();
        let store = FakeConnectorStore {
            connectors: vec![Connector {
                id: "conn-1".to_string(),
                tenant_id: "acme".to_string(),
                name: "warehouse agent".to_string(),
                connector_type: ConnectorType::Mini,
                api_key_hash: hash,
                created_at: Utc::now(),
            }],
        };
        Arc::new(AgentGateway::new(Arc::new(store), GatewaySettings::default()))
    }

    async fn connect(
        gateway: &AgentGateway,
        socket_id: &str,
    ) -> (AgentSession, mpsc::Receiver<GatewayToAgent>) {
        let (tx, mut rx) = mpsc::channel(16);
        let session =
            gateway.register(socket_id, API_KEY, None, None, tx).await.expect("register");
        // Swallow the authenticated frame.
        let first = rx.recv().await.expect("authenticated frame");
        assert!(matches!(first, GatewayToAgent::Authenticated { .. }));
        (session, rx)
    }

    #[tokio::test]
    async fn register_authenticates_and_emits_event() {
        let gateway = gateway_with_connector();
        let (session, _rx) = connect(&gateway, "sock-1").await;
        assert_eq!(session.tenant_id, "acme");
        assert_eq!(session.connector_id, "conn-1");
        assert_eq!(gateway.stats().sessions, 1);
    }

    #[tokio::test]
    async fn register_rejects_malformed_and_unknown_keys() {
        let gateway = gateway_with_connector();
        let (tx, _rx) = mpsc::channel(1);
        let err = gateway.register("s", "not_a_key", None, None, tx.clone()).await.unwrap_err();
        assert_eq!(err, GatewayError::MalformedApiKey);

        let err = gateway
            .register("s", "vmc_acme_other_key", None, None, tx)
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::AuthenticationFailed("acme".to_string()));
    }

    #[tokio::test]
    async fn register_rejects_duplicate_connector_session() {
        let gateway = gateway_with_connector();
        let (_session, _rx) = connect(&gateway, "sock-1").await;

        let (tx, _rx2) = mpsc::channel(1);
        let err = gateway.register("sock-2", API_KEY, None, None, tx).await.unwrap_err();
        assert_eq!(err, GatewayError::DuplicateSession("conn-1".to_string()));
    }

    #[tokio::test]
    async fn dispatch_without_session_queues_offline() {
        let gateway = gateway_with_connector();
        let outcome = gateway
            .dispatch_command("acme", "query", json!({"table": "t"}), None, CommandContext::default())
            .await;

        assert!(!outcome.success);
        assert!(outcome.command_id.starts_with("query_"));
        assert_eq!(gateway.stats().offline_queued, 1);
        let tracked = gateway.pending_command(&outcome.command_id).unwrap();
        assert_eq!(tracked.status, CommandStatus::Pending);
    }

    #[tokio::test]
    async fn reconnect_drains_offline_queue() {
        let gateway = gateway_with_connector();
        let outcome = gateway
            .dispatch_command("acme", "query", json!({"table": "t"}), Some("conn-1"), CommandContext::default())
            .await;
        assert!(!outcome.success);

        let (_session, mut rx) = connect(&gateway, "sock-1").await;

        let frame = rx.recv().await.expect("drained command");
        let GatewayToAgent::Command(envelope) = frame else { panic!("expected command") };
        assert_eq!(envelope.command_id, outcome.command_id);
        assert_eq!(envelope.operation, "query");
        assert_eq!(gateway.stats().offline_queued, 0);
        assert_eq!(
            gateway.pending_command(&outcome.command_id).unwrap().status,
            CommandStatus::Sent
        );
    }

    #[tokio::test]
    async fn dispatch_and_wait_resolves_on_response() {
        let gateway = gateway_with_connector();
        let (_session, mut rx) = connect(&gateway, "sock-1").await;

        let task = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .dispatch_and_wait(
                        "acme",
                        "query",
                        json!({"table": "users"}),
                        Some("conn-1"),
                        CommandContext::default(),
                        Some(Duration::from_secs(5)),
                    )
                    .await
            })
        };

        let frame = rx.recv().await.expect("command frame");
        let GatewayToAgent::Command(envelope) = frame else { panic!("expected command") };
        gateway.handle_response(&envelope.command_id, json!({"data": [{"id": 1}]}));

        let response = task.await.unwrap().unwrap();
        assert_eq!(response["data"][0]["id"], 1);
        assert_eq!(
            gateway.pending_command(&envelope.command_id).unwrap().status,
            CommandStatus::Completed
        );
    }

    #[tokio::test]
    async fn offline_command_completes_when_agent_arrives_inside_window() {
        let gateway = gateway_with_connector();

        let task = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .dispatch_and_wait(
                        "acme",
                        "query",
                        json!({"table": "users"}),
                        Some("conn-1"),
                        CommandContext::default(),
                        Some(Duration::from_secs(5)),
                    )
                    .await
            })
        };

        // Give the dispatch a chance to park on the offline queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.stats().offline_queued, 1);

        let (_session, mut rx) = connect(&gateway, "sock-1").await;
        let frame = rx.recv().await.expect("drained command");
        let GatewayToAgent::Command(envelope) = frame else { panic!("expected command") };
        gateway.handle_response(&envelope.command_id, json!({"rows": 2}));

        let response = task.await.unwrap().unwrap();
        assert_eq!(response["rows"], 2);
    }

    #[tokio::test]
    async fn wait_times_out_and_late_response_is_ignored() {
        let gateway = gateway_with_connector();
        let (_session, mut rx) = connect(&gateway, "sock-1").await;

        let err = gateway
            .dispatch_and_wait(
                "acme",
                "query",
                json!({}),
                Some("conn-1"),
                CommandContext::default(),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::CommandTimeout);

        // Late response: no waiter left, must not panic or change state.
        let frame = rx.recv().await.expect("command frame");
        let GatewayToAgent::Command(envelope) = frame else { panic!("expected command") };
        gateway.handle_response(&envelope.command_id, json!({"late": true}));
        assert_eq!(
            gateway.pending_command(&envelope.command_id).unwrap().status,
            CommandStatus::Completed
        );
    }

    #[tokio::test]
    async fn retry_sweeper_retires_commands_after_max_retries() {
        let gateway = {
            let hash = bcrypt::hash(API_KEY, 4).unwrap();
            let store = FakeConnectorStore {
                connectors: vec![Connector {
                    id: "conn-1".to_string(),
                    tenant_id: "acme".to_string(),
                    name: "agent".to_string(),
                    connector_type: ConnectorType::Mini,
                    api_key_hash: hash,
                    created_at: Utc::now(),
                }],
            };
            let settings = GatewaySettings {
                retry_delay: Duration::from_millis(0),
                max_retries: 2,
                ..GatewaySettings::default()
            };
            Arc::new(AgentGateway::new(Arc::new(store), settings))
        };
        let (_session, mut rx) = connect(&gateway, "sock-1").await;

        let outcome = gateway
            .dispatch_command("acme", "ping", json!({}), Some("conn-1"), CommandContext::default())
            .await;
        assert!(outcome.success);
        let _ = rx.recv().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // First sweep: one re-dispatch (attempts 1 -> 2 = max).
        gateway.sweep_pending_once().await;
        let _ = rx.recv().await;
        // Second sweep retires it.
        gateway.sweep_pending_once().await;

        assert_eq!(
            gateway.pending_command(&outcome.command_id).unwrap().status,
            CommandStatus::Failed
        );
    }

    #[tokio::test]
    async fn heartbeat_sweeper_reaps_stale_sessions() {
        let gateway = gateway_with_connector();
        let (_session, _rx) = connect(&gateway, "sock-1").await;

        // Backdate the heartbeat past the timeout.
        if let Some(mut entry) = gateway.sessions.get_mut("sock-1") {
            entry.session.last_heartbeat = Utc::now() - chrono::Duration::seconds(300);
        }

        gateway.sweep_sessions_once();
        assert_eq!(gateway.stats().sessions, 0);
        assert!(gateway.session_for_connector("conn-1").is_none());
    }

    #[tokio::test]
    async fn heartbeat_updates_session_and_metrics() {
        let gateway = gateway_with_connector();
        let (session, _rx) = connect(&gateway, "sock-1").await;
        let before = session.last_heartbeat;

        tokio::time::sleep(Duration::from_millis(10)).await;
        gateway.heartbeat(
            "sock-1",
            &HeartbeatPayload {
                timestamp: Some(Utc::now()),
                metrics: crate::domain::models::AgentMetrics {
                    cpu_usage: Some(0.5),
                    memory_usage: None,
                    uptime: Some(120),
                },
            },
        );

        let session = gateway.session_for_connector("conn-1").unwrap();
        assert!(session.last_heartbeat > before);
        assert_eq!(session.metrics.unwrap().cpu_usage, Some(0.5));
    }

    #[tokio::test]
    async fn schema_push_is_cached_on_the_session() {
        let gateway = gateway_with_connector();
        let (_session, _rx) = connect(&gateway, "sock-1").await;

        gateway.schema_discovered("sock-1", json!({"tables": ["users"]}));
        assert_eq!(
            gateway.session_schema("conn-1").unwrap()["tables"][0],
            "users"
        );
    }
}
