//! Cached, failure-tolerant view of the cost source.

use crate::source::{BillingPeriod, CostSample, CostSource, CostSourceError};
use relay_core::{Clock, ConfigError, CostMetrics, MetricsSink};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

/// Ratio assumed while the cost source cannot be read.
pub const DEFAULT_FALLBACK_RATIO: f64 = 0.90;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub budget_limit: f64,
    pub poll_interval: Duration,
    pub source_timeout: Duration,
    pub fallback_ratio: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            budget_limit: 1_000.0,
            poll_interval: Duration::from_secs(300),
            source_timeout: Duration::from_secs(10),
            fallback_ratio: DEFAULT_FALLBACK_RATIO,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.budget_limit.is_finite() && self.budget_limit > 0.0) {
            return Err(ConfigError::invalid(format!(
                "budget_limit must be positive, got {}",
                self.budget_limit
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll interval must be non-zero"));
        }
        if self.source_timeout.is_zero() {
            return Err(ConfigError::invalid("cost source timeout must be non-zero"));
        }
        if !(self.fallback_ratio > 0.0 && self.fallback_ratio.is_finite()) {
            return Err(ConfigError::invalid(format!(
                "fallback_ratio must be positive, got {}",
                self.fallback_ratio
            )));
        }
        Ok(())
    }
}

struct MonitorState {
    latest: CostMetrics,
    last_good: Option<CostMetrics>,
}

/// Polls a [`CostSource`] and keeps the most recent [`CostMetrics`].
///
/// Readers call [`CostMonitor::latest`], which never touches the source. Until
/// the first successful poll the cached sample is the conservative fallback.
pub struct CostMonitor {
    source: Arc<dyn CostSource>,
    cfg: MonitorConfig,
    state: RwLock<MonitorState>,
    failures: AtomicU32,
    sink: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl CostMonitor {
    pub fn new(
        source: Arc<dyn CostSource>,
        cfg: MonitorConfig,
        sink: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let initial = CostMetrics::conservative(cfg.budget_limit, cfg.fallback_ratio, clock.now_ms());
        Ok(Self {
            source,
            cfg,
            state: RwLock::new(MonitorState { latest: initial, last_good: None }),
            failures: AtomicU32::new(0),
            sink,
            clock,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.cfg
    }

    /// Most recent sample; never calls the source.
    pub fn latest(&self) -> CostMetrics {
        self.state.read().unwrap_or_else(|p| p.into_inner()).latest.clone()
    }

    /// Polls in the current failure streak (0 when the last poll succeeded).
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Query the source once (bounded by the configured timeout) and cache the result.
    ///
    /// Never fails: source errors produce a degraded sample instead.
    pub async fn poll(&self) -> CostMetrics {
        let now = self.clock.now_ms();
        let period = BillingPeriod::containing_ms(now);
        let span = info_span!("relay.cost.poll", period = %period.key());
        async {
            let fetched = match timeout(self.cfg.source_timeout, self.source.fetch_cost(&period)).await
            {
                Ok(res) => res.and_then(|s| s.validate().map(|()| s)),
                Err(_) => Err(CostSourceError::Timeout(self.cfg.source_timeout)),
            };
            match fetched {
                Ok(sample) => self.record_success(sample, now),
                Err(e) => self.record_failure(&e, now),
            }
        }
        .instrument(span)
        .await
    }

    fn record_success(&self, sample: CostSample, now: u64) -> CostMetrics {
        let metrics = CostMetrics::from_spend(
            sample.amount_spent,
            sample.projected_amount,
            sample.breakdown.data_transfer,
            sample.breakdown.compute,
            self.cfg.budget_limit,
            now,
        );
        {
            let mut st = self.state.write().unwrap_or_else(|p| p.into_inner());
            st.latest = metrics.clone();
            st.last_good = Some(metrics.clone());
        }
        let streak = self.failures.swap(0, Ordering::Relaxed);
        if streak > 0 {
            info!(failed_polls = streak, "cost source recovered");
        }
        self.sink.record_cost(&metrics);
        debug!(
            current_spend = metrics.current_spend,
            projected = metrics.projected_monthly_spend,
            cost_ratio = metrics.cost_ratio,
            "cost sample"
        );
        metrics
    }

    fn record_failure(&self, err: &CostSourceError, now: u64) -> CostMetrics {
        let streak = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        let metrics = {
            let mut st = self.state.write().unwrap_or_else(|p| p.into_inner());
            let last_good_ratio = st.last_good.as_ref().map_or(0.0, |m| m.cost_ratio);
            let ratio = self.cfg.fallback_ratio.max(last_good_ratio);
            let metrics = CostMetrics::conservative(self.cfg.budget_limit, ratio, now);
            st.latest = metrics.clone();
            metrics
        };
        // One warning per streak; repeats go to debug.
        if streak == 1 {
            warn!(error = %err, cost_ratio = metrics.cost_ratio, "cost source failed, using conservative estimate");
        } else {
            debug!(error = %err, streak, "cost source still failing");
        }
        self.sink.record_source_failure();
        metrics
    }
}
