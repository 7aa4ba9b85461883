//! Budget tracking for the relay guard.
//!
//! - [`CostSource`] is the opaque, periodically polled spend feed.
//! - [`CostMonitor`] caches the latest [`relay_core::CostMetrics`] and degrades to a
//!   conservative estimate when the source misbehaves.
//! - [`ModeController`] maps the budget ratio to an operating [`relay_core::Mode`]
//!   through an ordered threshold table.

#![deny(unsafe_code)]

pub mod mode;
pub mod monitor;
pub mod source;

pub use mode::{ModeController, ModeThresholds, ModeTransition, Observation};
pub use monitor::{CostMonitor, MonitorConfig, DEFAULT_FALLBACK_RATIO};
pub use source::{BillingPeriod, CostBreakdown, CostSample, CostSource, CostSourceError, FileCostSource};
