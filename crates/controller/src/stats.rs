//! Read-only views of cost and session state.

use crate::admission::DecisionMetrics;
use crate::registry::SessionRegistry;
use budget::{CostMonitor, ModeController, ModeTransition};
use relay_core::{Clock, CostMetrics, Mode, Tier};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub premium_count: usize,
    pub by_tier: BTreeMap<Tier, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub cost: CostMetrics,
    pub sessions: SessionStats,
    pub mode: Mode,
    /// A transition happened within the last poll interval.
    pub transitioned_recently: bool,
    pub last_transition: Option<ModeTransition>,
    pub decisions: BTreeMap<String, u64>,
    pub cost_source_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub mode: Mode,
    pub budget_used_percent: f64,
    pub active_sessions: usize,
    pub degraded: bool,
}

pub struct StatsReporter {
    monitor: Arc<CostMonitor>,
    modes: Arc<ModeController>,
    registry: Arc<SessionRegistry>,
    decisions: DecisionMetrics,
    clock: Arc<dyn Clock>,
}

impl StatsReporter {
    pub fn new(
        monitor: Arc<CostMonitor>,
        modes: Arc<ModeController>,
        registry: Arc<SessionRegistry>,
        decisions: DecisionMetrics,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { monitor, modes, registry, decisions, clock }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let by_tier = self.registry.count_by_tier();
        let total = by_tier.values().sum();
        let premium_count = by_tier.get(&Tier::Premium).copied().unwrap_or(0);
        let window_ms =
            u64::try_from(self.monitor.config().poll_interval.as_millis()).unwrap_or(u64::MAX);
        StatsSnapshot {
            cost: self.monitor.latest(),
            sessions: SessionStats { total, premium_count, by_tier },
            mode: self.modes.mode(),
            transitioned_recently: self.modes.transitioned_within(window_ms, self.clock.now_ms()),
            last_transition: self.modes.last_transition(),
            decisions: self.decisions.snapshot(),
            cost_source_failures: self.monitor.consecutive_failures(),
        }
    }

    pub fn health(&self) -> Health {
        let cost = self.monitor.latest();
        Health {
            mode: self.modes.mode(),
            budget_used_percent: cost.budget_used_percent(),
            active_sessions: self.registry.len(),
            degraded: cost.degraded,
        }
    }
}
