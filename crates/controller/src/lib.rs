//! Cost-aware admission controller for the relay guard, plus its gRPC surface.

#![deny(unsafe_code)]

use relay_core::{Mode, RouteMetadata, Session, SessionRequest, Tier};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

pub mod relay_v1 {
    tonic::include_proto!("relay.v1");
}

pub mod admission;
pub mod config;
pub mod registry;
pub mod runtime;
pub mod stats;

pub use admission::{
    AdmissionController, AdmissionDecision, DecisionMetrics, ReapReport, RejectReason, RetryHint,
    TransitionReport,
};
pub use config::ControllerConfig;
pub use registry::{RegistryError, SessionRegistry};
pub use runtime::{Controller, ControllerBuilder, RuntimeHandle};
pub use stats::{Health, SessionStats, StatsReporter, StatsSnapshot};

use relay_v1::{
    relay_guard_server::{RelayGuard, RelayGuardServer},
    *,
};

/// gRPC front end over an assembled [`Controller`].
#[derive(Clone)]
pub struct RelayGuardService {
    controller: Arc<Controller>,
}

#[allow(clippy::result_large_err)]
impl RelayGuardService {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    pub fn into_server(self) -> RelayGuardServer<Self> {
        RelayGuardServer::new(self)
    }

    fn check_auth(md: &tonic::metadata::MetadataMap) -> Result<(), Status> {
        if let Ok(Some(required)) =
            std::env::var("RELAY_AUTH_TOKEN").map(|s| if s.is_empty() { None } else { Some(s) })
        {
            match md.get("authorization").and_then(|v| v.to_str().ok()) {
                Some(got) if got == required => Ok(()),
                _ => Err(Status::unauthenticated("invalid authorization")),
            }
        } else {
            Ok(())
        }
    }
}

#[allow(clippy::result_large_err)]
fn parse_tier(raw: &str) -> Result<Tier, Status> {
    raw.parse::<Tier>().map_err(|e| Status::invalid_argument(e.to_string()))
}

fn route_from_proto(r: Option<Route>) -> RouteMetadata {
    r.map(|r| RouteMetadata { store_id: r.store_id, range_start: r.range_start, range_end: r.range_end })
        .unwrap_or_default()
}

fn grant_to_proto(s: &Session) -> SessionGrant {
    SessionGrant {
        session_id: s.session_id.clone(),
        peer_id: s.peer_id.clone(),
        tier: s.tier.to_string(),
        requested_bandwidth_mbps: s.requested_bandwidth_mbps,
        granted_bandwidth_mbps: s.granted_bandwidth_mbps,
        allocated_at_ms: s.allocated_at_ms,
        expires_at_ms: s.expires_at_ms,
    }
}

fn decision_to_proto(d: &AdmissionDecision, mode: Mode) -> RequestSessionResponse {
    match d {
        AdmissionDecision::Admit(s) => RequestSessionResponse {
            admitted: true,
            session: Some(grant_to_proto(s)),
            rejection: None,
            mode: mode.to_string(),
        },
        AdmissionDecision::Reject(r) => RequestSessionResponse {
            admitted: false,
            session: None,
            rejection: Some(Rejection {
                code: r.code().to_string(),
                retry_hint: r.retry_hint().to_string(),
                message: r.to_string(),
            }),
            mode: mode.to_string(),
        },
    }
}

fn stats_to_proto(s: &StatsSnapshot) -> GetStatsResponse {
    GetStatsResponse {
        mode: s.mode.to_string(),
        current_spend: s.cost.current_spend,
        projected_monthly_spend: s.cost.projected_monthly_spend,
        budget_limit: s.cost.budget_limit,
        cost_ratio: s.cost.cost_ratio,
        degraded: s.cost.degraded,
        total_sessions: saturating_u32(s.sessions.total),
        premium_sessions: saturating_u32(s.sessions.premium_count),
        sessions_by_tier: s
            .sessions
            .by_tier
            .iter()
            .map(|(t, n)| (t.to_string(), saturating_u32(*n)))
            .collect(),
        transitioned_recently: s.transitioned_recently,
        last_transition: s.last_transition.map(|t| ModeTransitionInfo {
            from: t.from.to_string(),
            to: t.to.to_string(),
            cost_ratio: t.cost_ratio,
            at_ms: t.at_ms,
        }),
        decisions: s.decisions.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        cost_source_failures: s.cost_source_failures,
    }
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[allow(clippy::result_large_err)]
#[tonic::async_trait]
impl RelayGuard for RelayGuardService {
    #[instrument(skip_all)]
    async fn request_session(
        &self,
        req: Request<RequestSessionRequest>,
    ) -> Result<Response<RequestSessionResponse>, Status> {
        Self::check_auth(req.metadata())?;
        let r = req.into_inner();
        let request = SessionRequest {
            tier: parse_tier(&r.tier)?,
            peer_id: r.peer_id,
            estimated_bandwidth_mbps: r.estimated_bandwidth_mbps,
            p2p_attempted: r.p2p_attempted,
            route: route_from_proto(r.route),
        };
        let admission = self.controller.admission();
        let decision = admission.request_session(&request);
        Ok(Response::new(decision_to_proto(&decision, admission.mode())))
    }

    #[instrument(skip_all)]
    async fn end_session(
        &self,
        req: Request<EndSessionRequest>,
    ) -> Result<Response<EndSessionResponse>, Status> {
        Self::check_auth(req.metadata())?;
        let r = req.into_inner();
        if r.peer_id.is_empty() {
            return Err(Status::invalid_argument("missing peer_id"));
        }
        let ended = self.controller.admission().end_session(&r.peer_id);
        info!(peer = %r.peer_id, ended = ended.len(), "EndSession");
        Ok(Response::new(EndSessionResponse {
            session_ids: ended.into_iter().map(|s| s.session_id).collect(),
        }))
    }

    #[instrument(skip_all)]
    async fn heartbeat(
        &self,
        req: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        Self::check_auth(req.metadata())?;
        let r = req.into_inner();
        let route = route_from_proto(r.route);
        let known = self.controller.admission().record_activity(&r.peer_id, &route);
        Ok(Response::new(HeartbeatResponse { known }))
    }

    #[instrument(skip_all)]
    async fn get_stats(
        &self,
        req: Request<GetStatsRequest>,
    ) -> Result<Response<GetStatsResponse>, Status> {
        Self::check_auth(req.metadata())?;
        Ok(Response::new(stats_to_proto(&self.controller.stats().snapshot())))
    }

    #[instrument(skip_all)]
    async fn get_health(
        &self,
        req: Request<GetHealthRequest>,
    ) -> Result<Response<GetHealthResponse>, Status> {
        Self::check_auth(req.metadata())?;
        let h = self.controller.stats().health();
        Ok(Response::new(GetHealthResponse {
            mode: h.mode.to_string(),
            budget_used_percent: h.budget_used_percent,
            active_sessions: saturating_u32(h.active_sessions),
            degraded: h.degraded,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tier_is_invalid_argument() {
        let err = parse_tier("gold").unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(parse_tier("premium").unwrap(), Tier::Premium);
    }

    #[test]
    fn rejection_carries_code_and_hint() {
        let d = AdmissionDecision::Reject(RejectReason::P2PRequired { mode: Mode::Warning });
        let resp = decision_to_proto(&d, Mode::Warning);
        assert!(!resp.admitted);
        assert!(resp.session.is_none());
        let rej = resp.rejection.unwrap();
        assert_eq!(rej.code, "p2p_required");
        assert_eq!(rej.retry_hint, "try_p2p_first");
        assert_eq!(resp.mode, "warning");
    }

    #[test]
    fn missing_route_is_default() {
        assert_eq!(route_from_proto(None), RouteMetadata::default());
        let r = route_from_proto(Some(Route {
            store_id: "s".into(),
            range_start: Some(1),
            range_end: None,
        }));
        assert_eq!(r.store_id, "s");
        assert_eq!(r.range_start, Some(1));
    }
}
