//! External cost source contract.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Calendar month the spend figures refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    /// The calendar month containing `at`.
    pub fn containing(at: DateTime<Utc>) -> Self {
        let start = Utc.with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0).single().unwrap_or(at);
        let (year, month) =
            if at.month() == 12 { (at.year() + 1, 1) } else { (at.year(), at.month() + 1) };
        let end = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().unwrap_or(at);
        Self { start, end }
    }

    pub fn containing_ms(at_ms: u64) -> Self {
        let at = i64::try_from(at_ms)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_default();
        Self::containing(at)
    }

    /// Month key, e.g. `2026-10`.
    pub fn key(&self) -> String {
        self.start.format("%Y-%m").to_string()
    }
}

/// Spend split reported by the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    #[serde(default, alias = "dataTransfer")]
    pub data_transfer: f64,
    #[serde(default)]
    pub compute: f64,
}

/// Raw reading from the cost source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostSample {
    #[serde(alias = "amountSpent")]
    pub amount_spent: f64,
    #[serde(alias = "projectedAmount")]
    pub projected_amount: f64,
    #[serde(default)]
    pub breakdown: CostBreakdown,
}

impl CostSample {
    /// Reject readings no sane billing API would produce.
    pub fn validate(&self) -> Result<(), CostSourceError> {
        let fields = [
            ("amount_spent", self.amount_spent),
            ("projected_amount", self.projected_amount),
            ("breakdown.data_transfer", self.breakdown.data_transfer),
            ("breakdown.compute", self.breakdown.compute),
        ];
        for (name, v) in fields {
            if !v.is_finite() || v < 0.0 {
                return Err(CostSourceError::Malformed(format!("{name} = {v}")));
            }
        }
        Ok(())
    }
}

/// Failures of the cost source. Absorbed by the monitor, never shown to callers.
#[derive(Debug, Error)]
pub enum CostSourceError {
    #[error("cost source timed out after {0:?}")]
    Timeout(Duration),
    #[error("cost source unavailable: {0}")]
    Unavailable(String),
    #[error("malformed cost response: {0}")]
    Malformed(String),
}

/// Opaque spend feed, polled off the request path.
#[async_trait]
pub trait CostSource: Send + Sync {
    async fn fetch_cost(&self, period: &BillingPeriod) -> Result<CostSample, CostSourceError>;
}

/// Reads a [`CostSample`] JSON document that an exporter rewrites periodically.
#[derive(Debug, Clone)]
pub struct FileCostSource {
    path: PathBuf,
}

impl FileCostSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl CostSource for FileCostSource {
    async fn fetch_cost(&self, _period: &BillingPeriod) -> Result<CostSample, CostSourceError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CostSourceError::Unavailable(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&raw).map_err(|e| CostSourceError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_spans_calendar_month() {
        let at = Utc.with_ymd_and_hms(2026, 12, 17, 8, 30, 0).unwrap();
        let p = BillingPeriod::containing(at);
        assert_eq!(p.start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(p.end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(p.key(), "2026-12");
    }

    #[test]
    fn negative_and_nan_samples_are_malformed() {
        let ok = CostSample { amount_spent: 1.0, projected_amount: 2.0, breakdown: CostBreakdown::default() };
        assert!(ok.validate().is_ok());
        let neg = CostSample { amount_spent: -1.0, ..ok };
        assert!(matches!(neg.validate(), Err(CostSourceError::Malformed(_))));
        let nan = CostSample { projected_amount: f64::NAN, ..ok };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn accepts_camel_case_payloads() {
        let s: CostSample = serde_json::from_str(
            r#"{"amountSpent": 120.5, "projectedAmount": 300.0, "breakdown": {"dataTransfer": 100.0, "compute": 20.5}}"#,
        )
        .unwrap();
        assert_eq!(s.amount_spent, 120.5);
        assert_eq!(s.breakdown.data_transfer, 100.0);
    }

    #[tokio::test]
    async fn file_source_reports_missing_file_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let src = FileCostSource::new(dir.path().join("missing.json"));
        let period = BillingPeriod::containing(Utc::now());
        assert!(matches!(src.fetch_cost(&period).await, Err(CostSourceError::Unavailable(_))));

        let path = dir.path().join("cost.json");
        std::fs::write(&path, "{not json").unwrap();
        let src = FileCostSource::new(&path);
        assert!(matches!(src.fetch_cost(&period).await, Err(CostSourceError::Malformed(_))));
    }
}
