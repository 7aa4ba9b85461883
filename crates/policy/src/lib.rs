//! Relay Tier Policy
//!
//! Static rules deciding what each tier may get in each operating mode. The
//! policy is pure data: it never looks at live sessions or spend.
//!
//! Eligibility of **new** sessions (fixed, not configurable):
//! - Normal, Warning: every tier
//! - Throttle: Premium only
//! - Emergency, Shutdown: nobody
//!
//! Survival of **existing** sessions after a mode change:
//! - Normal, Warning, Throttle: everyone stays
//! - Emergency: Premium only
//! - Shutdown: nobody
//!
//! Grants are `min(requested, tier entitlement, mode ceiling)` with no rounding.
//! Ceilings and durations are configurable; a stricter mode can never be
//! configured to grant more bandwidth or time than a laxer one.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use relay_core::{ConfigError, Entitlement, Mode, Tier};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

/// Entitlement table, one row per tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entitlements {
    /// Free tier row.
    pub free: Entitlement,
    /// Basic tier row.
    pub basic: Entitlement,
    /// Standard tier row.
    pub standard: Entitlement,
    /// Premium tier row.
    pub premium: Entitlement,
}

impl Default for Entitlements {
    fn default() -> Self {
        let e = |mbps: f64, sessions: u32| Entitlement {
            max_bandwidth_mbps: mbps,
            max_concurrent_sessions: sessions,
        };
        Self {
            free: e(10.0, 1),
            basic: e(25.0, 2),
            standard: e(50.0, 5),
            premium: e(100.0, 10),
        }
    }
}

impl Entitlements {
    /// Row for `tier`.
    pub fn get(&self, tier: Tier) -> Entitlement {
        match tier {
            Tier::Free => self.free,
            Tier::Basic => self.basic,
            Tier::Standard => self.standard,
            Tier::Premium => self.premium,
        }
    }
}

/// Per-mode bandwidth and duration caps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeLimits {
    /// Session lifetime cap in Normal mode; `None` means unbounded.
    pub normal_duration_secs: Option<u64>,
    /// Session lifetime cap in Warning mode.
    pub warning_duration_secs: u64,
    /// Bandwidth ceiling in Throttle mode.
    pub throttle_bandwidth_mbps: f64,
    /// Session lifetime cap in Throttle mode.
    pub throttle_duration_secs: u64,
    /// Bandwidth ceiling in Emergency mode.
    pub emergency_bandwidth_mbps: f64,
    /// Session lifetime cap in Emergency mode.
    pub emergency_duration_secs: u64,
}

impl Default for ModeLimits {
    fn default() -> Self {
        Self {
            normal_duration_secs: None,
            warning_duration_secs: 30 * 60,
            throttle_bandwidth_mbps: 20.0,
            throttle_duration_secs: 10 * 60,
            emergency_bandwidth_mbps: 5.0,
            emergency_duration_secs: 5 * 60,
        }
    }
}

/// Policy as written in YAML. Every field is optional and falls back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Per-tier entitlements.
    pub entitlements: Entitlements,
    /// Per-mode ceilings.
    pub mode_limits: ModeLimits,
    /// Mode from which a P2P attempt is required before relaying; `None` disables the check.
    pub require_p2p_from: Option<Mode>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            entitlements: Entitlements::default(),
            mode_limits: ModeLimits::default(),
            require_p2p_from: Some(Mode::Warning),
        }
    }
}

impl PolicyConfig {
    /// Check entitlements and ceilings. Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tier in Tier::ALL {
            let e = self.entitlements.get(tier);
            if !(e.max_bandwidth_mbps.is_finite() && e.max_bandwidth_mbps > 0.0) {
                return Err(ConfigError::invalid(format!(
                    "entitlements.{tier}.max_bandwidth_mbps must be positive, got {}",
                    e.max_bandwidth_mbps
                )));
            }
            if e.max_concurrent_sessions == 0 {
                return Err(ConfigError::invalid(format!(
                    "entitlements.{tier}.max_concurrent_sessions must be at least 1"
                )));
            }
        }

        let l = &self.mode_limits;
        for (name, v) in [
            ("throttle_bandwidth_mbps", l.throttle_bandwidth_mbps),
            ("emergency_bandwidth_mbps", l.emergency_bandwidth_mbps),
        ] {
            if !(v.is_finite() && v > 0.0) {
                return Err(ConfigError::invalid(format!(
                    "mode_limits.{name} must be positive, got {v}"
                )));
            }
        }
        if l.emergency_bandwidth_mbps > l.throttle_bandwidth_mbps {
            return Err(ConfigError::invalid(
                "mode_limits.emergency_bandwidth_mbps must not exceed throttle_bandwidth_mbps",
            ));
        }

        let durations = [
            ("normal_duration_secs", l.normal_duration_secs),
            ("warning_duration_secs", Some(l.warning_duration_secs)),
            ("throttle_duration_secs", Some(l.throttle_duration_secs)),
            ("emergency_duration_secs", Some(l.emergency_duration_secs)),
        ];
        for (name, v) in durations {
            if v == Some(0) {
                return Err(ConfigError::invalid(format!("mode_limits.{name} must be non-zero")));
            }
        }
        // Unbounded (None) is the laxest value, so it may only appear first.
        for pair in durations.windows(2) {
            let ((lax_name, lax), (strict_name, strict)) = (pair[0], pair[1]);
            if let (Some(lax), Some(strict)) = (lax, strict) {
                if strict > lax {
                    return Err(ConfigError::invalid(format!(
                        "mode_limits.{strict_name} ({strict}) must not exceed {lax_name} ({lax})"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Validated, immutable tier policy.
#[derive(Debug, Clone, PartialEq)]
pub struct TierPolicy {
    cfg: PolicyConfig,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self { cfg: PolicyConfig::default() }
    }
}

impl TierPolicy {
    /// Build a policy, rejecting invalid configuration.
    pub fn new(cfg: PolicyConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    /// Load and validate a policy from a YAML file at `path`.
    pub fn load_from_yaml_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let display = path.as_ref().display().to_string();
        let f = File::open(&path).map_err(|e| ConfigError::Io { path: display.clone(), source: e })?;
        let cfg: PolicyConfig = serde_yaml::from_reader(BufReader::new(f))
            .map_err(|e| ConfigError::Parse { path: display, message: e.to_string() })?;
        Self::new(cfg)
    }

    /// Parse and validate a policy from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let cfg: PolicyConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::Parse { path: "<inline>".into(), message: e.to_string() })?;
        Self::new(cfg)
    }

    /// The configuration this policy was built from.
    pub fn config(&self) -> &PolicyConfig {
        &self.cfg
    }

    /// Baseline entitlement of `tier`.
    pub fn entitlement(&self, tier: Tier) -> Entitlement {
        self.cfg.entitlements.get(tier)
    }

    /// Whether `tier` may open a **new** session in `mode`.
    pub fn eligible(&self, tier: Tier, mode: Mode) -> bool {
        match mode {
            Mode::Normal | Mode::Warning => true,
            Mode::Throttle => tier.is_premium(),
            Mode::Emergency | Mode::Shutdown => false,
        }
    }

    /// Whether an **existing** session of `tier` stays alive after entering `mode`.
    pub fn survives(&self, tier: Tier, mode: Mode) -> bool {
        match mode {
            Mode::Normal | Mode::Warning | Mode::Throttle => true,
            Mode::Emergency => tier.is_premium(),
            Mode::Shutdown => false,
        }
    }

    /// Bandwidth cap imposed by `mode`; `None` means only the tier limit applies.
    pub fn bandwidth_ceiling(&self, mode: Mode) -> Option<f64> {
        match mode {
            Mode::Normal | Mode::Warning => None,
            Mode::Throttle => Some(self.cfg.mode_limits.throttle_bandwidth_mbps),
            Mode::Emergency => Some(self.cfg.mode_limits.emergency_bandwidth_mbps),
            Mode::Shutdown => Some(0.0),
        }
    }

    /// Session lifetime cap imposed by `mode`; `None` means unbounded.
    pub fn duration_ceiling(&self, mode: Mode) -> Option<Duration> {
        let l = &self.cfg.mode_limits;
        match mode {
            Mode::Normal => l.normal_duration_secs.map(Duration::from_secs),
            Mode::Warning => Some(Duration::from_secs(l.warning_duration_secs)),
            Mode::Throttle => Some(Duration::from_secs(l.throttle_duration_secs)),
            Mode::Emergency => Some(Duration::from_secs(l.emergency_duration_secs)),
            Mode::Shutdown => Some(Duration::ZERO),
        }
    }

    /// `min(requested, entitlement, mode ceiling)`; never negative.
    pub fn granted_bandwidth(&self, tier: Tier, mode: Mode, requested_mbps: f64) -> f64 {
        let ceiling = self.bandwidth_ceiling(mode).unwrap_or(f64::INFINITY);
        requested_mbps.min(self.entitlement(tier).max_bandwidth_mbps).min(ceiling).max(0.0)
    }

    /// Whether a relay request must be preceded by a P2P attempt in `mode`.
    pub fn p2p_required(&self, mode: Mode) -> bool {
        self.cfg.require_p2p_from.is_some_and(|floor| mode >= floor)
    }
}
