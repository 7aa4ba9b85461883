//! Budget ratio → operating mode.

use relay_core::{ConfigError, Mode};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::{info, warn};

/// Lower bounds (inclusive) of each non-normal mode, as fractions of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeThresholds {
    pub warning: f64,
    pub throttle: f64,
    pub emergency: f64,
    pub shutdown: f64,
}

impl Default for ModeThresholds {
    fn default() -> Self {
        Self { warning: 0.70, throttle: 0.85, emergency: 0.95, shutdown: 0.98 }
    }
}

impl ModeThresholds {
    /// Thresholds must lie in (0, 1) and be strictly increasing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = [
            ("warning", self.warning),
            ("throttle", self.throttle),
            ("emergency", self.emergency),
            ("shutdown", self.shutdown),
        ];
        for (name, v) in ordered {
            if !(v > 0.0 && v < 1.0) {
                return Err(ConfigError::invalid(format!(
                    "threshold {name} = {v} must be within (0, 1)"
                )));
            }
        }
        for pair in ordered.windows(2) {
            let ((lo_name, lo), (hi_name, hi)) = (pair[0], pair[1]);
            if lo >= hi {
                return Err(ConfigError::invalid(format!(
                    "threshold {lo_name} ({lo}) must be below {hi_name} ({hi})"
                )));
            }
        }
        Ok(())
    }

    /// `(threshold, mode)` pairs, strictest first.
    pub fn table(&self) -> [(f64, Mode); 4] {
        [
            (self.shutdown, Mode::Shutdown),
            (self.emergency, Mode::Emergency),
            (self.throttle, Mode::Throttle),
            (self.warning, Mode::Warning),
        ]
    }

    /// First row whose threshold the ratio reaches wins.
    pub fn mode_for(&self, ratio: f64) -> Mode {
        self.table()
            .into_iter()
            .find(|(threshold, _)| ratio >= *threshold)
            .map_or(Mode::Normal, |(_, mode)| mode)
    }
}

/// A recorded change of operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: Mode,
    pub to: Mode,
    pub cost_ratio: f64,
    pub at_ms: u64,
}

/// Result of [`ModeController::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub mode: Mode,
    pub previous: Mode,
    pub transitioned: bool,
}

impl Observation {
    /// True when the new mode is stricter than the previous one.
    pub fn escalated(&self) -> bool {
        self.mode > self.previous
    }
}

#[derive(Debug, Default)]
struct ModeState {
    mode: Mode,
    last_transition: Option<ModeTransition>,
}

/// Remembers the last observed mode so callers can react to transitions.
#[derive(Debug)]
pub struct ModeController {
    thresholds: ModeThresholds,
    state: RwLock<ModeState>,
}

impl ModeController {
    pub fn new(thresholds: ModeThresholds) -> Result<Self, ConfigError> {
        thresholds.validate()?;
        Ok(Self { thresholds, state: RwLock::new(ModeState::default()) })
    }

    /// Start in the mode `ratio` maps to, without recording a transition.
    pub fn starting_at(thresholds: ModeThresholds, ratio: f64) -> Result<Self, ConfigError> {
        thresholds.validate()?;
        let state = ModeState { mode: thresholds.mode_for(ratio), last_transition: None };
        Ok(Self { thresholds, state: RwLock::new(state) })
    }

    pub fn thresholds(&self) -> &ModeThresholds {
        &self.thresholds
    }

    /// Pure mapping; does not touch the remembered mode.
    pub fn current_mode(&self, ratio: f64) -> Mode {
        self.thresholds.mode_for(ratio)
    }

    /// Map `ratio`, remember the result and report whether it changed.
    pub fn observe(&self, ratio: f64, at_ms: u64) -> Observation {
        let mode = self.current_mode(ratio);
        let mut st = self.state.write().unwrap_or_else(|p| p.into_inner());
        let previous = st.mode;
        if mode == previous {
            return Observation { mode, previous, transitioned: false };
        }
        st.mode = mode;
        st.last_transition = Some(ModeTransition { from: previous, to: mode, cost_ratio: ratio, at_ms });
        drop(st);
        if mode > previous {
            warn!(from=%previous, to=%mode, cost_ratio=ratio, "operating mode escalated");
        } else {
            info!(from=%previous, to=%mode, cost_ratio=ratio, "operating mode relaxed");
        }
        Observation { mode, previous, transitioned: true }
    }

    /// Last observed mode.
    pub fn mode(&self) -> Mode {
        self.state.read().unwrap_or_else(|p| p.into_inner()).mode
    }

    pub fn last_transition(&self) -> Option<ModeTransition> {
        self.state.read().unwrap_or_else(|p| p.into_inner()).last_transition
    }

    /// Whether a transition happened within `window_ms` before `now_ms`.
    pub fn transitioned_within(&self, window_ms: u64, now_ms: u64) -> bool {
        self.last_transition().is_some_and(|t| now_ms.saturating_sub(t.at_ms) <= window_ms)
    }
}
