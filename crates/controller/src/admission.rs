//! Admission decisions and mode-transition sweeps.

use crate::registry::{RegistryError, SessionRegistry};
use budget::{CostMonitor, ModeController};
use dashmap::DashMap;
use event_log::{JsonlEventLog, RelayEvent};
use policy::TierPolicy;
use relay_core::{
    ids, Clock, CostMetrics, Mode, RouteMetadata, Session, SessionRequest, TerminationCause, Tier,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

/// What a rejected peer should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryHint {
    TryP2pFirst,
    WaitForBudgetCycle,
    UpgradeTier,
    RetryLater,
    FixRequest,
}

impl RetryHint {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryHint::TryP2pFirst => "try_p2p_first",
            RetryHint::WaitForBudgetCycle => "wait_for_budget_cycle",
            RetryHint::UpgradeTier => "upgrade_tier",
            RetryHint::RetryLater => "retry_later",
            RetryHint::FixRequest => "fix_request",
        }
    }
}

impl fmt::Display for RetryHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session request was refused. Always a normal outcome, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("tier {tier} is at its limit of {limit} concurrent sessions")]
    CapacityExceeded { tier: Tier, limit: u32 },
    #[error("peer {peer_id} already holds a session for this route")]
    DuplicatePeer { peer_id: String },
    #[error("tier {tier} cannot open relay sessions in {mode} mode")]
    TierIneligibleForMode { tier: Tier, mode: Mode },
    #[error("a direct peer-to-peer attempt is required before relaying in {mode} mode")]
    P2PRequired { mode: Mode },
    #[error("relay service is shut down until the budget recovers")]
    ServiceShutdown,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RejectReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::CapacityExceeded { .. } => "capacity_exceeded",
            RejectReason::DuplicatePeer { .. } => "duplicate_peer",
            RejectReason::TierIneligibleForMode { .. } => "tier_ineligible_for_mode",
            RejectReason::P2PRequired { .. } => "p2p_required",
            RejectReason::ServiceShutdown => "service_shutdown",
            RejectReason::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn retry_hint(&self) -> RetryHint {
        match self {
            RejectReason::CapacityExceeded { .. } | RejectReason::DuplicatePeer { .. } => {
                RetryHint::RetryLater
            }
            // Throttle admits Premium; nothing helps in Emergency.
            RejectReason::TierIneligibleForMode { tier, mode } => {
                if *mode == Mode::Throttle && !tier.is_premium() {
                    RetryHint::UpgradeTier
                } else {
                    RetryHint::WaitForBudgetCycle
                }
            }
            RejectReason::P2PRequired { .. } => RetryHint::TryP2pFirst,
            RejectReason::ServiceShutdown => RetryHint::WaitForBudgetCycle,
            RejectReason::InvalidRequest(_) => RetryHint::FixRequest,
        }
    }
}

impl From<RegistryError> for RejectReason {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::CapacityExceeded { tier, limit } => {
                RejectReason::CapacityExceeded { tier, limit }
            }
            RegistryError::DuplicatePeer { peer_id } => RejectReason::DuplicatePeer { peer_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Admit(Session),
    Reject(RejectReason),
}

impl AdmissionDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, AdmissionDecision::Admit(_))
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            AdmissionDecision::Admit(s) => Some(s),
            AdmissionDecision::Reject(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            AdmissionDecision::Admit(_) => None,
            AdmissionDecision::Reject(r) => Some(r),
        }
    }
}

/// Auditable result of a mode change.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionReport {
    pub from: Mode,
    pub to: Mode,
    pub cost_ratio: f64,
    pub at_ms: u64,
    /// Sessions the sweep ended, oldest first.
    pub terminated: Vec<Session>,
}

/// Sessions removed by one reap pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReapReport {
    pub expired: Vec<Session>,
    pub idle: Vec<Session>,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.expired.len() + self.idle.len()
    }
}

/// Decision counters keyed by `admitted` or a reject code.
#[derive(Clone, Default)]
pub struct DecisionMetrics {
    counts: Arc<DashMap<&'static str, u64>>,
}

impl DecisionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, key: &'static str) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    pub fn record(&self, decision: &AdmissionDecision) {
        match decision {
            AdmissionDecision::Admit(_) => self.bump("admitted"),
            AdmissionDecision::Reject(r) => self.bump(r.code()),
        }
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).map_or(0, |v| *v.value())
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts.iter().map(|kv| ((*kv.key()).to_string(), *kv.value())).collect()
    }
}

/// Decides admissions against the cached cost picture and sweeps on mode changes.
///
/// Admissions hold the transition gate shared; a transition takes it
/// exclusively, so no admission observes a mode whose sweep is half done.
pub struct AdmissionController {
    monitor: Arc<CostMonitor>,
    modes: Arc<ModeController>,
    policy: Arc<TierPolicy>,
    registry: Arc<SessionRegistry>,
    clock: Arc<dyn Clock>,
    idle_timeout: Option<Duration>,
    gate: RwLock<()>,
    decisions: DecisionMetrics,
    audit: Option<JsonlEventLog>,
}

impl AdmissionController {
    pub fn new(
        monitor: Arc<CostMonitor>,
        modes: Arc<ModeController>,
        policy: Arc<TierPolicy>,
        registry: Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            monitor,
            modes,
            policy,
            registry,
            clock,
            idle_timeout: None,
            gate: RwLock::new(()),
            decisions: DecisionMetrics::new(),
            audit: None,
        }
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn with_audit_log(mut self, log: JsonlEventLog) -> Self {
        self.audit = Some(log);
        self
    }

    pub fn decisions(&self) -> &DecisionMetrics {
        &self.decisions
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Mode currently enforced.
    pub fn mode(&self) -> Mode {
        self.modes.mode()
    }

    pub fn request_session(&self, req: &SessionRequest) -> AdmissionDecision {
        let span = info_span!(
            "relay.admission.check",
            peer = %req.peer_id,
            tier = %req.tier,
            requested_mbps = req.estimated_bandwidth_mbps,
        );
        let _enter = span.enter();

        let decision = match validate_request(req) {
            Err(reason) => AdmissionDecision::Reject(reason),
            Ok(()) => {
                self.sync_mode();
                let _shared = self.gate.read().unwrap_or_else(PoisonError::into_inner);
                self.decide(req, self.modes.mode())
            }
        };

        self.decisions.record(&decision);
        let mode = self.modes.mode();
        match &decision {
            AdmissionDecision::Admit(s) => {
                info!(
                    session = %s.session_id,
                    granted_mbps = s.granted_bandwidth_mbps,
                    expires_at_ms = ?s.expires_at_ms,
                    %mode,
                    "relay session admitted"
                );
                self.audit(&RelayEvent::admitted(s, mode));
            }
            AdmissionDecision::Reject(r) => {
                debug!(code = r.code(), hint = %r.retry_hint(), %mode, "relay session rejected");
                self.audit(&RelayEvent::SessionRejected {
                    peer_id: req.peer_id.clone(),
                    tier: req.tier,
                    mode,
                    reason: r.code().to_string(),
                });
            }
        }
        decision
    }

    fn decide(&self, req: &SessionRequest, mode: Mode) -> AdmissionDecision {
        if mode == Mode::Shutdown {
            return AdmissionDecision::Reject(RejectReason::ServiceShutdown);
        }
        if !self.policy.eligible(req.tier, mode) {
            return AdmissionDecision::Reject(RejectReason::TierIneligibleForMode {
                tier: req.tier,
                mode,
            });
        }
        let granted =
            self.policy.granted_bandwidth(req.tier, mode, req.estimated_bandwidth_mbps);
        if !req.p2p_attempted && self.policy.p2p_required(mode) {
            return AdmissionDecision::Reject(RejectReason::P2PRequired { mode });
        }
        let now = self.clock.now_ms();
        let expires_at_ms = self
            .policy
            .duration_ceiling(mode)
            .map(|d| now.saturating_add(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)));
        let session = Session {
            session_id: ids::new_session_id(),
            peer_id: req.peer_id.clone(),
            tier: req.tier,
            requested_bandwidth_mbps: req.estimated_bandwidth_mbps,
            granted_bandwidth_mbps: granted,
            allocated_at_ms: now,
            expires_at_ms,
            last_activity_ms: now,
            route: req.route.clone(),
        };
        match self.registry.admit(session) {
            Ok(s) => AdmissionDecision::Admit(s),
            Err(e) => AdmissionDecision::Reject(e.into()),
        }
    }

    /// Hook for the poll loop: record a fresh sample and apply any transition it implies.
    ///
    /// The mode always follows the monitor's latest sample, so handing in an
    /// older sample audits it but cannot undo a newer transition.
    pub fn apply_cost_sample(&self, metrics: &CostMetrics) -> Option<TransitionReport> {
        self.audit(&RelayEvent::cost_sampled(metrics));
        self.sync_mode()
    }

    fn sync_mode(&self) -> Option<TransitionReport> {
        if self.modes.current_mode(self.monitor.latest().cost_ratio) == self.modes.mode() {
            return None;
        }
        let (report, events) = {
            let _exclusive = self.gate.write().unwrap_or_else(PoisonError::into_inner);
            // Re-read: a newer sample may have landed while we waited for the gate.
            let ratio = self.monitor.latest().cost_ratio;
            let at_ms = self.clock.now_ms();
            let obs = self.modes.observe(ratio, at_ms);
            if !obs.transitioned {
                return None;
            }
            let span = info_span!(
                "relay.mode.transition",
                from = %obs.previous,
                to = %obs.mode,
                cost_ratio = ratio,
            );
            let _enter = span.enter();
            let terminated = self.registry.sweep(|s| !self.policy.survives(s.tier, obs.mode));
            if terminated.is_empty() {
                info!("mode transition swept no sessions");
            } else {
                warn!(terminated = terminated.len(), "mode transition terminated sessions");
            }
            let mut events = Vec::with_capacity(terminated.len() + 1);
            events.push(RelayEvent::ModeTransition {
                from: obs.previous,
                to: obs.mode,
                cost_ratio: ratio,
                terminated: terminated.len(),
            });
            events.extend(terminated.iter().map(|s| RelayEvent::terminated(s, TerminationCause::Sweep)));
            let report =
                TransitionReport { from: obs.previous, to: obs.mode, cost_ratio: ratio, at_ms, terminated };
            (report, events)
        };
        // Disk writes happen after the gate is released.
        for event in &events {
            self.audit(event);
        }
        Some(report)
    }

    /// End expired sessions and, when an idle timeout is configured, idle ones.
    pub fn reap(&self) -> ReapReport {
        let span = info_span!("relay.registry.reap");
        let _enter = span.enter();
        let expired = self.registry.reap_expired();
        let idle = self.idle_timeout.map(|t| self.registry.reap_idle(t)).unwrap_or_default();
        for s in &expired {
            self.audit(&RelayEvent::terminated(s, TerminationCause::Expired));
        }
        for s in &idle {
            self.audit(&RelayEvent::terminated(s, TerminationCause::Idle));
        }
        let report = ReapReport { expired, idle };
        if report.total() > 0 {
            info!(expired = report.expired.len(), idle = report.idle.len(), "reaped sessions");
        }
        report
    }

    /// Explicit termination of every session held by `peer_id`.
    pub fn end_session(&self, peer_id: &str) -> Vec<Session> {
        let ended = self.registry.terminate(peer_id);
        for s in &ended {
            self.audit(&RelayEvent::terminated(s, TerminationCause::Explicit));
        }
        ended
    }

    pub fn record_activity(&self, peer_id: &str, route: &RouteMetadata) -> bool {
        self.registry.record_activity(peer_id, route)
    }

    /// End everything; used when the controller stops.
    pub fn terminate_all(&self, cause: TerminationCause) -> Vec<Session> {
        let ended = {
            let _exclusive = self.gate.write().unwrap_or_else(PoisonError::into_inner);
            self.registry.terminate_all()
        };
        for s in &ended {
            self.audit(&RelayEvent::terminated(s, cause));
        }
        ended
    }

    fn audit(&self, event: &RelayEvent) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.append(self.clock.now_ms(), event) {
                warn!(error = %e, event = event.kind(), "audit append failed");
            }
        }
    }
}

fn validate_request(req: &SessionRequest) -> Result<(), RejectReason> {
    if req.peer_id.trim().is_empty() {
        return Err(RejectReason::InvalidRequest("peer_id must not be empty".into()));
    }
    let bw = req.estimated_bandwidth_mbps;
    if !(bw.is_finite() && bw > 0.0) {
        return Err(RejectReason::InvalidRequest(format!(
            "estimated_bandwidth_mbps must be positive, got {bw}"
        )));
    }
    if let (Some(start), Some(end)) = (req.route.range_start, req.route.range_end) {
        if start > end {
            return Err(RejectReason::InvalidRequest(format!(
                "byte range start {start} is after end {end}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_hints_are_stable() {
        let cases = [
            (RejectReason::CapacityExceeded { tier: Tier::Free, limit: 1 }, "capacity_exceeded", "retry_later"),
            (RejectReason::DuplicatePeer { peer_id: "p".into() }, "duplicate_peer", "retry_later"),
            (
                RejectReason::TierIneligibleForMode { tier: Tier::Basic, mode: Mode::Throttle },
                "tier_ineligible_for_mode",
                "upgrade_tier",
            ),
            (
                RejectReason::TierIneligibleForMode { tier: Tier::Premium, mode: Mode::Emergency },
                "tier_ineligible_for_mode",
                "wait_for_budget_cycle",
            ),
            (RejectReason::P2PRequired { mode: Mode::Warning }, "p2p_required", "try_p2p_first"),
            (RejectReason::ServiceShutdown, "service_shutdown", "wait_for_budget_cycle"),
            (RejectReason::InvalidRequest("x".into()), "invalid_request", "fix_request"),
        ];
        for (reason, code, hint) in cases {
            assert_eq!(reason.code(), code);
            assert_eq!(reason.retry_hint().as_str(), hint);
        }
    }

    #[test]
    fn malformed_requests_are_invalid() {
        let base = SessionRequest {
            peer_id: "p".into(),
            estimated_bandwidth_mbps: 10.0,
            tier: Tier::Basic,
            p2p_attempted: true,
            route: RouteMetadata::default(),
        };
        assert!(validate_request(&base).is_ok());
        for bw in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let r = SessionRequest { estimated_bandwidth_mbps: bw, ..base.clone() };
            assert!(matches!(validate_request(&r), Err(RejectReason::InvalidRequest(_))));
        }
        let r = SessionRequest { peer_id: "  ".into(), ..base.clone() };
        assert!(validate_request(&r).is_err());
        let mut r = base;
        r.route.range_start = Some(10);
        r.route.range_end = Some(5);
        assert!(validate_request(&r).is_err());
    }

    #[test]
    fn decision_counters_by_code() {
        let m = DecisionMetrics::new();
        m.record(&AdmissionDecision::Reject(RejectReason::ServiceShutdown));
        m.record(&AdmissionDecision::Reject(RejectReason::ServiceShutdown));
        assert_eq!(m.get("service_shutdown"), 2);
        assert_eq!(m.get("admitted"), 0);
        assert_eq!(m.snapshot().get("service_shutdown"), Some(&2));
    }
}
