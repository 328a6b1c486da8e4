//! Tenant tiers and the capacity limits attached to them.

use serde::{Deserialize, Serialize};

/// Service tier assigned to a tenant. Admission limits, queue placement and
/// worker concurrency all derive from the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TenantTier {
    Free,
    Standard,
    Enterprise,
}

impl TenantTier {
    pub const ALL: [TenantTier; 3] = [Self::Free, Self::Standard, Self::Enterprise];

    /// Name of the tier-isolated execution queue.
    pub fn queue_name(self) -> &'static str {
        match self {
            Self::Free => "workflow-exec-free",
            Self::Standard => "workflow-exec-standard",
            Self::Enterprise => "workflow-exec-enterprise",
        }
    }

    pub fn default_limits(self) -> TierLimits {
        match self {
            Self::Free => TierLimits {
                max_concurrent_jobs: 5,
                max_jobs_per_hour: 100,
                worker_concurrency: 5,
            },
            Self::Standard => TierLimits {
                max_concurrent_jobs: 20,
                max_jobs_per_hour: 1_000,
                worker_concurrency: 20,
            },
            Self::Enterprise => TierLimits {
                max_concurrent_jobs: 100,
                max_jobs_per_hour: 10_000,
                worker_concurrency: 100,
            },
        }
    }
}

impl std::fmt::Display for TenantTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Free => "FREE",
            Self::Standard => "STANDARD",
            Self::Enterprise => "ENTERPRISE",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TenantTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FREE" => Ok(Self::Free),
            "STANDARD" => Ok(Self::Standard),
            "ENTERPRISE" => Ok(Self::Enterprise),
            other => Err(format!("Unknown tenant tier: {other}")),
        }
    }
}

/// Capacity numbers for a tier. Per-tenant overrides may raise or lower the
/// job limits; worker concurrency is fixed per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_concurrent_jobs: u64,
    pub max_jobs_per_hour: u64,
    pub worker_concurrency: usize,
}

/// Optional per-tenant adjustments applied over the tier defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantOverride {
    pub max_concurrent_jobs: Option<u64>,
    pub max_jobs_per_hour: Option<u64>,
}

impl TierLimits {
    pub fn with_override(mut self, ov: &TenantOverride) -> Self {
        if let Some(v) = ov.max_concurrent_jobs {
            self.max_concurrent_jobs = v;
        }
        if let Some(v) = ov.max_jobs_per_hour {
            self.max_jobs_per_hour = v;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_defaults_match_table() {
        let free = TenantTier::Free.default_limits();
        assert_eq!(free.max_concurrent_jobs, 5);
        assert_eq!(free.max_jobs_per_hour, 100);

        let ent = TenantTier::Enterprise.default_limits();
        assert_eq!(ent.max_concurrent_jobs, 100);
        assert_eq!(ent.worker_concurrency, 100);
    }

    #[test]
    fn overrides_can_raise_or_lower() {
        let limits = TenantTier::Free.default_limits().with_override(&TenantOverride {
            max_concurrent_jobs: Some(2),
            max_jobs_per_hour: Some(500),
        });
        assert_eq!(limits.max_concurrent_jobs, 2);
        assert_eq!(limits.max_jobs_per_hour, 500);
        assert_eq!(limits.worker_concurrency, 5);
    }
}
