//! Relay guard core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the relay core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ids {
    //! Session ids and wall-clock timestamps.

    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    /// Milliseconds since UNIX epoch.
    pub fn now_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    /// Opaque relay session identifier (`sess-` + UUID v4).
    pub fn new_session_id() -> String {
        format!("sess-{}", Uuid::new_v4())
    }

}

pub mod clock {
    //! Clock abstraction so expiry and idle bookkeeping can run on virtual time.

    use std::sync::Mutex;

    /// Returns milliseconds since UNIX epoch.
    pub trait Clock: Send + Sync {
        fn now_ms(&self) -> u64;
    }

    /// Wall clock.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now_ms(&self) -> u64 {
            super::ids::now_ms()
        }
    }

    /// Manually driven clock for tests and simulations.
    #[derive(Debug)]
    pub struct VirtualClock {
        inner: Mutex<u64>,
    }

    impl VirtualClock {
        pub fn new(start_ms: u64) -> Self {
            Self { inner: Mutex::new(start_ms) }
        }

        pub fn advance_ms(&self, delta_ms: u64) {
            let mut t = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            *t = t.saturating_add(delta_ms);
        }

        pub fn set_ms(&self, value: u64) {
            let mut t = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            *t = value;
        }
    }

    impl Clock for VirtualClock {
        fn now_ms(&self) -> u64 {
            *self.inner.lock().unwrap_or_else(|p| p.into_inner())
        }
    }

}

pub mod tier {
    //! Peer service classes and their baseline entitlements.

    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;

    /// A peer's service class.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    )]
    #[serde(rename_all = "snake_case")]
    pub enum Tier {
        Free,
        Basic,
        Standard,
        Premium,
    }

    impl Tier {
        /// Every tier, cheapest first.
        pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Standard, Tier::Premium];

        pub fn is_premium(self) -> bool {
            matches!(self, Tier::Premium)
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Tier::Free => "free",
                Tier::Basic => "basic",
                Tier::Standard => "standard",
                Tier::Premium => "premium",
            }
        }
    }

    impl fmt::Display for Tier {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Error for unknown tier names.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unknown tier '{0}'")]
    pub struct ParseTierError(pub String);

    impl FromStr for Tier {
        type Err = ParseTierError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.trim().to_ascii_lowercase().as_str() {
                "free" => Ok(Tier::Free),
                "basic" => Ok(Tier::Basic),
                "standard" => Ok(Tier::Standard),
                "premium" => Ok(Tier::Premium),
                _ => Err(ParseTierError(s.to_string())),
            }
        }
    }

    /// Static resource entitlement of a tier.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Entitlement {
        pub max_bandwidth_mbps: f64,
        pub max_concurrent_sessions: u32,
    }

}

pub mod mode {
    //! Operating modes, ordered by severity.

    use serde::{Deserialize, Serialize};
    use std::fmt;

    /// Operating posture of the controller, derived from budget consumption.
    ///
    /// The derive order is the severity order: `Normal < Warning < ... < Shutdown`.
    #[derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Default,
        Serialize,
        Deserialize,
    )]
    #[serde(rename_all = "snake_case")]
    pub enum Mode {
        #[default]
        Normal,
        Warning,
        Throttle,
        Emergency,
        Shutdown,
    }

    impl Mode {
        pub const ALL: [Mode; 5] =
            [Mode::Normal, Mode::Warning, Mode::Throttle, Mode::Emergency, Mode::Shutdown];

        /// Numeric severity: higher = stricter.
        pub fn severity(self) -> u8 {
            self as u8
        }

        pub fn as_str(self) -> &'static str {
            match self {
                Mode::Normal => "normal",
                Mode::Warning => "warning",
                Mode::Throttle => "throttle",
                Mode::Emergency => "emergency",
                Mode::Shutdown => "shutdown",
            }
        }
    }

    impl fmt::Display for Mode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

}

pub mod cost {
    //! Cost metrics: the cached view of monthly spend.

    use serde::{Deserialize, Serialize};

    /// One reconciled cost sample. Replaced wholesale on every poll.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct CostMetrics {
        pub current_spend: f64,
        pub projected_monthly_spend: f64,
        pub budget_limit: f64,
        /// `current_spend / budget_limit`, never negative.
        pub cost_ratio: f64,
        pub data_transfer_cost: f64,
        pub compute_cost: f64,
        pub sampled_at_ms: u64,
        /// True when synthesized from the conservative fallback.
        pub degraded: bool,
    }

    impl CostMetrics {
        /// Build metrics from a successful source reading.
        pub fn from_spend(
            current_spend: f64,
            projected_monthly_spend: f64,
            data_transfer_cost: f64,
            compute_cost: f64,
            budget_limit: f64,
            sampled_at_ms: u64,
        ) -> Self {
            Self {
                current_spend,
                projected_monthly_spend,
                budget_limit,
                cost_ratio: ratio(current_spend, budget_limit),
                data_transfer_cost,
                compute_cost,
                sampled_at_ms,
                degraded: false,
            }
        }

        /// Conservative stand-in used while the cost source is failing.
        ///
        /// Spend figures are derived from `cost_ratio` so the sample stays
        /// internally consistent.
        pub fn conservative(budget_limit: f64, cost_ratio: f64, sampled_at_ms: u64) -> Self {
            let cost_ratio = cost_ratio.max(0.0);
            let spend = cost_ratio * budget_limit;
            Self {
                current_spend: spend,
                projected_monthly_spend: spend,
                budget_limit,
                cost_ratio,
                data_transfer_cost: 0.0,
                compute_cost: 0.0,
                sampled_at_ms,
                degraded: true,
            }
        }

        /// Percentage of the budget consumed, for health surfaces.
        pub fn budget_used_percent(&self) -> f64 {
            self.cost_ratio * 100.0
        }
    }

    fn ratio(spend: f64, limit: f64) -> f64 {
        if limit > 0.0 && spend.is_finite() {
            (spend / limit).max(0.0)
        } else {
            0.0
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ratio_is_clamped_non_negative() {
            let m = CostMetrics::from_spend(-5.0, 0.0, 0.0, 0.0, 100.0, 1);
            assert_eq!(m.cost_ratio, 0.0);
            let m = CostMetrics::from_spend(42.0, 80.0, 30.0, 12.0, 100.0, 1);
            assert!((m.cost_ratio - 0.42).abs() < 1e-12);
            assert!(!m.degraded);
        }

        #[test]
        fn conservative_sample_is_degraded() {
            let m = CostMetrics::conservative(1_000.0, 0.9, 7);
            assert!(m.degraded);
            assert!((m.current_spend - 900.0).abs() < 1e-9);
            assert!((m.budget_used_percent() - 90.0).abs() < 1e-9);
        }
    }
}

pub mod session {
    //! Relay sessions and admission requests.

    use super::tier::Tier;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /// Opaque routing metadata; the controller only compares it for equality.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RouteMetadata {
        pub store_id: String,
        #[serde(default)]
        pub range_start: Option<u64>,
        #[serde(default)]
        pub range_end: Option<u64>,
    }

    /// Request for a new relay session.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SessionRequest {
        pub peer_id: String,
        pub estimated_bandwidth_mbps: f64,
        pub tier: Tier,
        /// Whether the peer tried a direct P2P connection first.
        pub p2p_attempted: bool,
        #[serde(default)]
        pub route: RouteMetadata,
    }

    /// A granted relay session. Bandwidth and expiry never change after admission.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Session {
        pub session_id: String,
        pub peer_id: String,
        pub tier: Tier,
        pub requested_bandwidth_mbps: f64,
        pub granted_bandwidth_mbps: f64,
        pub allocated_at_ms: u64,
        /// `None` when the admitting mode had no duration cap.
        pub expires_at_ms: Option<u64>,
        pub last_activity_ms: u64,
        pub route: RouteMetadata,
    }

    impl Session {
        pub fn key(&self) -> SessionKey {
            SessionKey { peer_id: self.peer_id.clone(), route: self.route.clone() }
        }

        pub fn is_expired(&self, now_ms: u64) -> bool {
            self.expires_at_ms.is_some_and(|at| now_ms >= at)
        }
    }

    /// Registry key: one session per peer per store/range.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct SessionKey {
        pub peer_id: String,
        pub route: RouteMetadata,
    }

    /// Why a session left the registry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TerminationCause {
        Sweep,
        Expired,
        Idle,
        Explicit,
        ControllerShutdown,
    }

    impl fmt::Display for TerminationCause {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = match self {
                TerminationCause::Sweep => "sweep",
                TerminationCause::Expired => "expired",
                TerminationCause::Idle => "idle",
                TerminationCause::Explicit => "explicit",
                TerminationCause::ControllerShutdown => "controller_shutdown",
            };
            f.write_str(s)
        }
    }

}

pub mod sink {
    //! Metrics sink the monitor and controller emit to.

    use super::cost::CostMetrics;

    /// Receiver of periodic cost and session gauges. Must be cheap and non-blocking.
    pub trait MetricsSink: Send + Sync {
        /// Called with every good cost sample.
        fn record_cost(&self, metrics: &CostMetrics);
        /// Called once per failed poll.
        fn record_source_failure(&self) {}
        /// Called once per poll cycle with the live session count.
        fn record_active_sessions(&self, count: usize);
    }

    /// Discards everything.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NoopSink;

    impl MetricsSink for NoopSink {
        fn record_cost(&self, _metrics: &CostMetrics) {}
        fn record_active_sessions(&self, _count: usize) {}
    }
}

pub mod error {
    //! Startup configuration errors.

    use thiserror::Error;

    /// Fatal configuration problems, reported at startup only.
    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error("invalid configuration: {0}")]
        InvalidConfiguration(String),
        #[error("failed to read {path}: {source}")]
        Io {
            path: String,
            #[source]
            source: std::io::Error,
        },
        #[error("malformed configuration in {path}: {message}")]
        Parse { path: String, message: String },
    }

    impl ConfigError {
        pub fn invalid(msg: impl Into<String>) -> Self {
            ConfigError::InvalidConfiguration(msg.into())
        }
    }
}

pub use clock::{Clock, SystemClock, VirtualClock};
pub use cost::CostMetrics;
pub use error::ConfigError;
pub use mode::Mode;
pub use session::{RouteMetadata, Session, SessionKey, SessionRequest, TerminationCause};
pub use sink::{MetricsSink, NoopSink};
pub use tier::{Entitlement, Tier};
