//! Tiered admission control: per-tenant hourly rate limits, per-tier
//! concurrency caps, queue-depth guards, and the tier-isolated FIFO
//! worker pools that drain admitted executions.
//!
//! Admission is the only place capacity decisions are made; within a pool,
//! jobs are dequeued FIFO and there is no preemption across tenants.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::AdmissionError;
use crate::domain::models::{AdmissionConfig, TenantTier};

/// Queue-depth guard multiplier over `max_concurrent_jobs`.
const BACKLOG_FACTOR: u64 = 10;

/// Fraction of the concurrency cap at which admission starts rejecting,
/// so clients back off before true saturation.
const UTILISATION_REJECT: f64 = 0.9;

/// A unit of admitted work handed to a tier worker.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub execution_id: Uuid,
    pub tenant_id: String,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
}

/// Counters surfaced per tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    pub jobs_this_hour: u64,
    pub active_jobs: u64,
    pub queue_depth: u64,
}

#[derive(Debug, Default)]
struct TierCounters {
    active: AtomicU64,
    queued: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct HourWindow {
    hour_start: DateTime<Utc>,
    count: u64,
}

pub struct AdmissionController {
    config: AdmissionConfig,
    hourly: Mutex<HashMap<String, HourWindow>>,
    free: TierCounters,
    standard: TierCounters,
    enterprise: TierCounters,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            hourly: Mutex::new(HashMap::new()),
            free: TierCounters::default(),
            standard: TierCounters::default(),
            enterprise: TierCounters::default(),
        }
    }

    pub fn tier_of(&self, tenant_id: &str) -> TenantTier {
        self.config.tier_of(tenant_id)
    }

    /// Run the ordered admission checks for a tenant. On accept, the job
    /// counts against the tenant's hourly window; the caller then enqueues
    /// it on the tier queue.
    pub fn check(&self, tenant_id: &str) -> Result<TenantTier, AdmissionError> {
        self.check_at(tenant_id, Utc::now())
    }

    fn check_at(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<TenantTier, AdmissionError> {
        let tier = self.config.tier_of(tenant_id);
        let limits = self.config.limits_for(tenant_id);
        let counters = self.counters(tier);

        let hour_start = truncate_to_hour(now);
        let mut hourly = self.hourly.lock().expect("hourly lock");
        let window = hourly
            .entry(tenant_id.to_string())
            .or_insert(HourWindow { hour_start, count: 0 });
        if window.hour_start != hour_start {
            *window = HourWindow { hour_start, count: 0 };
        }

        if window.count >= limits.max_jobs_per_hour {
            warn!(tenant_id, jobs = window.count, "admission rejected: rate limited");
            return Err(AdmissionError::RateLimited {
                jobs_this_hour: window.count,
                max_jobs_per_hour: limits.max_jobs_per_hour,
            });
        }

        let active = counters.active.load(Ordering::Relaxed);
        let saturated = active >= limits.max_concurrent_jobs
            || active as f64 / limits.max_concurrent_jobs as f64 > UTILISATION_REJECT;
        if saturated {
            warn!(tenant_id, active, "admission rejected: at capacity");
            return Err(AdmissionError::AtCapacity {
                active,
                max: limits.max_concurrent_jobs,
            });
        }

        let queued = counters.queued.load(Ordering::Relaxed);
        let max_depth = limits.max_concurrent_jobs * BACKLOG_FACTOR;
        if queued >= max_depth {
            warn!(tenant_id, queued, "admission rejected: backlog");
            return Err(AdmissionError::Backlog { depth: queued, max: max_depth });
        }

        window.count += 1;
        debug!(tenant_id, tier = %tier, jobs_this_hour = window.count, "admission accepted");
        Ok(tier)
    }

    pub fn stats(&self, tenant_id: &str) -> AdmissionStats {
        let tier = self.config.tier_of(tenant_id);
        let counters = self.counters(tier);
        let now_hour = truncate_to_hour(Utc::now());
        let jobs_this_hour = self
            .hourly
            .lock()
            .expect("hourly lock")
            .get(tenant_id)
            .filter(|w| w.hour_start == now_hour)
            .map(|w| w.count)
            .unwrap_or(0);

        AdmissionStats {
            jobs_this_hour,
            active_jobs: counters.active.load(Ordering::Relaxed),
            queue_depth: counters.queued.load(Ordering::Relaxed),
        }
    }

    pub fn record_enqueued(&self, tier: TenantTier) {
        self.counters(tier).queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self, tier: TenantTier) {
        let counters = self.counters(tier);
        counters.queued.fetch_sub(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self, tier: TenantTier) {
        self.counters(tier).active.fetch_sub(1, Ordering::Relaxed);
    }

    fn counters(&self, tier: TenantTier) -> &TierCounters {
        match tier {
            TenantTier::Free => &self.free,
            TenantTier::Standard => &self.standard,
            TenantTier::Enterprise => &self.enterprise,
        }
    }
}

fn truncate_to_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

// ============================================================================
// Tier worker pools
// ============================================================================

/// Handles to the tier-isolated FIFO queues.
pub struct TierQueues {
    senders: HashMap<TenantTier, mpsc::UnboundedSender<ExecutionJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl TierQueues {
    /// Spawn one FIFO queue per tier, drained by that tier's fixed worker
    /// concurrency. `runner` drives a single admitted execution to a
    /// parked or terminal state.
    pub fn spawn<F, Fut>(admission: Arc<AdmissionController>, runner: F) -> Self
    where
        F: Fn(ExecutionJob) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut senders = HashMap::new();
        let mut workers = Vec::new();

        for tier in TenantTier::ALL {
            let (tx, rx) = mpsc::unbounded_channel::<ExecutionJob>();
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            senders.insert(tier, tx);

            let concurrency = tier.default_limits().worker_concurrency;
            info!(tier = %tier, queue = tier.queue_name(), concurrency, "starting tier workers");

            for _ in 0..concurrency {
                let rx = Arc::clone(&rx);
                let admission = Arc::clone(&admission);
                let runner = runner.clone();
                workers.push(tokio::spawn(async move {
                    loop {
                        // Hold the receiver lock only for the dequeue so
                        // the pool drains FIFO across workers.
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };

                        admission.record_dequeued(tier);
                        runner(job).await;
                        admission.record_finished(tier);
                    }
                }));
            }
        }

        Self { senders, workers }
    }

    /// Enqueue an admitted job on its tier queue.
    pub fn submit(
        &self,
        admission: &AdmissionController,
        tier: TenantTier,
        job: ExecutionJob,
    ) -> bool {
        admission.record_enqueued(tier);
        match self.senders.get(&tier) {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Stop accepting work and let workers drain.
    pub fn shutdown(mut self) -> Vec<JoinHandle<()>> {
        self.senders.clear();
        std::mem::take(&mut self.workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TenantOverride;
    use chrono::Duration;

    fn controller() -> AdmissionController {
        AdmissionController::new(AdmissionConfig::default())
    }

    #[test]
    fn free_tenant_is_rate_limited_at_101st_job() {
        let admission = controller();
        for _ in 0..100 {
            admission.check("t-free").expect("within hourly budget");
        }

        let err = admission.check("t-free").unwrap_err();
        assert_eq!(
            err,
            AdmissionError::RateLimited { jobs_this_hour: 100, max_jobs_per_hour: 100 }
        );
        assert_eq!(admission.stats("t-free").jobs_this_hour, 100);
    }

    #[test]
    fn hourly_window_resets_on_the_hour() {
        let admission = controller();
        let t0 = Utc::now();
        for _ in 0..100 {
            admission.check_at("t-free", t0).expect("within hourly budget");
        }
        assert!(admission.check_at("t-free", t0).is_err());

        let next_hour = t0 + Duration::hours(1);
        assert!(admission.check_at("t-free", next_hour).is_ok());
    }

    #[test]
    fn tier_capacity_rejects_when_saturated() {
        let admission = controller();
        for _ in 0..5 {
            admission.record_enqueued(TenantTier::Free);
            admission.record_dequeued(TenantTier::Free);
        }

        let err = admission.check("t-free").unwrap_err();
        assert_eq!(err, AdmissionError::AtCapacity { active: 5, max: 5 });

        admission.record_finished(TenantTier::Free);
        assert!(admission.check("t-free").is_ok());
    }

    #[test]
    fn queue_depth_guard_rejects_backlog() {
        let admission = controller();
        for _ in 0..50 {
            admission.record_enqueued(TenantTier::Free);
        }

        let err = admission.check("t-free").unwrap_err();
        assert_eq!(err, AdmissionError::Backlog { depth: 50, max: 50 });
    }

    #[test]
    fn per_tenant_override_lowers_the_hourly_budget() {
        let mut config = AdmissionConfig::default();
        config.overrides.insert(
            "small".to_string(),
            TenantOverride { max_concurrent_jobs: None, max_jobs_per_hour: Some(2) },
        );
        let admission = AdmissionController::new(config);

        assert!(admission.check("small").is_ok());
        assert!(admission.check("small").is_ok());
        assert!(matches!(
            admission.check("small").unwrap_err(),
            AdmissionError::RateLimited { jobs_this_hour: 2, .. }
        ));
    }

    #[test]
    fn tenants_share_tier_capacity_but_not_hourly_windows() {
        let admission = controller();
        for _ in 0..100 {
            admission.check("a").unwrap();
        }
        // A different tenant still has its own hourly budget.
        assert!(admission.check("b").is_ok());
    }

    #[tokio::test]
    async fn tier_queue_runs_jobs_fifo_and_tracks_counters() {
        let admission = Arc::new(controller());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let queues = {
            let seen = Arc::clone(&seen);
            TierQueues::spawn(Arc::clone(&admission), move |job: ExecutionJob| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(job.tenant_id.clone());
                }
            })
        };

        for i in 0..3 {
            let tier = admission.check(&format!("tenant-{i}")).unwrap();
            queues.submit(
                &admission,
                tier,
                ExecutionJob {
                    execution_id: Uuid::new_v4(),
                    tenant_id: format!("tenant-{i}"),
                    workflow_id: Uuid::new_v4(),
                    workflow_version: 1,
                },
            );
        }

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(seen.lock().unwrap().len(), 3);
        let stats = admission.stats("tenant-0");
        assert_eq!(stats.active_jobs, 0);
        assert_eq!(stats.queue_depth, 0);
    }
}
