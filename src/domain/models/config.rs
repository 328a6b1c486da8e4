//! Control-plane configuration model, loaded via the hierarchical
//! figment loader in `infrastructure::config`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::tenant::{TenantOverride, TenantTier};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub engine: EngineConfig,
    pub admission: AdmissionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: ".vectormesh/vectormesh.db".to_string(), max_connections: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// Optional log file; stdout when unset.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string(), file: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8091 }
    }
}

/// Remote-agent channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Expected heartbeat cadence from agents.
    pub heartbeat_interval_secs: u64,
    /// Sessions older than this without a heartbeat are reaped.
    pub heartbeat_timeout_secs: u64,
    /// Sweep cadence for the heartbeat and command-retry sweepers.
    pub sweep_interval_secs: u64,
    /// Delivery retries per command before it is marked failed.
    pub max_retries: u32,
    /// Linear backoff unit between delivery retries.
    pub retry_delay_secs: u64,
    /// Default wait for a `command:response`.
    pub response_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            sweep_interval_secs: 10,
            max_retries: 3,
            retry_delay_secs: 5,
            response_timeout_secs: 30,
        }
    }
}

/// Orchestrator and handler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default timeout for connector queries and remote-agent calls.
    pub activity_timeout_secs: u64,
    /// Timeout for load batches.
    pub load_timeout_secs: u64,
    /// Wall-clock bound on sandbox evaluation.
    pub sandbox_timeout_secs: u64,
    /// Default activity retry cap for retryable handler errors.
    pub max_activity_retries: u32,
    /// First retry delay; doubles per subsequent retry.
    pub retry_base_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            activity_timeout_secs: 30,
            load_timeout_secs: 60,
            sandbox_timeout_secs: 30,
            max_activity_retries: 3,
            retry_base_delay_ms: 5_000,
        }
    }
}

/// Tenant tier assignments and per-tenant limit overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Tier for tenants not listed in `tenants`.
    pub default_tier: DefaultTier,
    /// Explicit tenant -> tier assignments.
    pub tenants: HashMap<String, TenantTier>,
    /// Per-tenant limit overrides over the tier defaults.
    pub overrides: HashMap<String, TenantOverride>,
}

/// Newtype so the serde default for the tier is FREE rather than the
/// enum's first variant by accident elsewhere.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DefaultTier(pub TenantTier);

impl Default for DefaultTier {
    fn default() -> Self {
        Self(TenantTier::Free)
    }
}

impl AdmissionConfig {
    pub fn tier_of(&self, tenant_id: &str) -> TenantTier {
        self.tenants.get(tenant_id).copied().unwrap_or(self.default_tier.0)
    }

    pub fn limits_for(&self, tenant_id: &str) -> super::tenant::TierLimits {
        let tier = self.tier_of(tenant_id);
        let limits = tier.default_limits();
        match self.overrides.get(tenant_id) {
            Some(ov) => limits.with_override(ov),
            None => limits,
        }
    }
}
