//! Typed relay events. Field order is fixed by declaration order.

use relay_core::{CostMetrics, Mode, Session, TerminationCause, Tier};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    CostSampled {
        current_spend: f64,
        projected_monthly_spend: f64,
        cost_ratio: f64,
        degraded: bool,
    },
    ModeTransition {
        from: Mode,
        to: Mode,
        cost_ratio: f64,
        terminated: usize,
    },
    SessionAdmitted {
        session_id: String,
        peer_id: String,
        tier: Tier,
        mode: Mode,
        granted_bandwidth_mbps: f64,
        expires_at_ms: Option<u64>,
    },
    SessionRejected {
        peer_id: String,
        tier: Tier,
        mode: Mode,
        reason: String,
    },
    SessionTerminated {
        session_id: String,
        peer_id: String,
        tier: Tier,
        cause: TerminationCause,
    },
}

impl RelayEvent {
    /// Short name matching the serialized `event` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::CostSampled { .. } => "cost_sampled",
            RelayEvent::ModeTransition { .. } => "mode_transition",
            RelayEvent::SessionAdmitted { .. } => "session_admitted",
            RelayEvent::SessionRejected { .. } => "session_rejected",
            RelayEvent::SessionTerminated { .. } => "session_terminated",
        }
    }

    pub fn cost_sampled(m: &CostMetrics) -> Self {
        RelayEvent::CostSampled {
            current_spend: m.current_spend,
            projected_monthly_spend: m.projected_monthly_spend,
            cost_ratio: m.cost_ratio,
            degraded: m.degraded,
        }
    }

    pub fn admitted(s: &Session, mode: Mode) -> Self {
        RelayEvent::SessionAdmitted {
            session_id: s.session_id.clone(),
            peer_id: s.peer_id.clone(),
            tier: s.tier,
            mode,
            granted_bandwidth_mbps: s.granted_bandwidth_mbps,
            expires_at_ms: s.expires_at_ms,
        }
    }

    pub fn terminated(s: &Session, cause: TerminationCause) -> Self {
        RelayEvent::SessionTerminated {
            session_id: s.session_id.clone(),
            peer_id: s.peer_id.clone(),
            tier: s.tier,
            cause,
        }
    }

    /// Peer the event concerns, if any.
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            RelayEvent::SessionAdmitted { peer_id, .. }
            | RelayEvent::SessionRejected { peer_id, .. }
            | RelayEvent::SessionTerminated { peer_id, .. } => Some(peer_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_matches_kind() {
        let ev = RelayEvent::ModeTransition {
            from: Mode::Throttle,
            to: Mode::Emergency,
            cost_ratio: 0.96,
            terminated: 3,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], ev.kind());
        assert_eq!(v["to"], "emergency");
        let back: RelayEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn termination_cause_is_snake_case() {
        let ev = RelayEvent::SessionTerminated {
            session_id: "s1".into(),
            peer_id: "p1".into(),
            tier: Tier::Basic,
            cause: TerminationCause::ControllerShutdown,
        };
        let line = serde_json::to_string(&ev).unwrap();
        assert!(line.contains("\"cause\":\"controller_shutdown\""), "{line}");
        assert_eq!(ev.peer_id(), Some("p1"));
    }
}
