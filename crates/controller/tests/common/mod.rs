#![allow(dead_code)]

use async_trait::async_trait;
use budget::{BillingPeriod, CostBreakdown, CostSample, CostSource, CostSourceError};
use controller::{Controller, ControllerBuilder, ControllerConfig};
use relay_core::{RouteMetadata, SessionRequest, Tier, VirtualClock};
use std::sync::{Arc, Mutex};

pub const BUDGET: f64 = 1_000.0;
pub const T0: u64 = 1_760_000_000_000;

/// Cost source whose reading is set by the test; `None` makes it fail.
pub struct Dial {
    ratio: Mutex<Option<f64>>,
}

impl Dial {
    pub fn at(ratio: f64) -> Arc<Self> {
        Arc::new(Self { ratio: Mutex::new(Some(ratio)) })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { ratio: Mutex::new(None) })
    }

    pub fn set(&self, ratio: f64) {
        *self.ratio.lock().unwrap() = Some(ratio);
    }

    pub fn fail(&self) {
        *self.ratio.lock().unwrap() = None;
    }
}

#[async_trait]
impl CostSource for Dial {
    async fn fetch_cost(&self, _p: &BillingPeriod) -> Result<CostSample, CostSourceError> {
        match *self.ratio.lock().unwrap() {
            Some(r) => Ok(CostSample {
                amount_spent: r * BUDGET,
                projected_amount: r * BUDGET * 1.2,
                breakdown: CostBreakdown { data_transfer: r * BUDGET * 0.8, compute: r * BUDGET * 0.2 },
            }),
            None => Err(CostSourceError::Unavailable("billing api down".into())),
        }
    }
}

pub fn config() -> ControllerConfig {
    ControllerConfig { budget_limit: BUDGET, ..ControllerConfig::default() }
}

pub fn build(cfg: ControllerConfig, dial: Arc<Dial>) -> (Arc<Controller>, Arc<VirtualClock>) {
    let clock = Arc::new(VirtualClock::new(T0));
    let controller = ControllerBuilder::new(cfg)
        .with_source(dial)
        .with_clock(clock.clone())
        .build()
        .unwrap();
    (Arc::new(controller), clock)
}

/// Built and polled once, so the mode reflects `dial`.
pub async fn controller_at(ratio: f64) -> (Arc<Controller>, Arc<Dial>, Arc<VirtualClock>) {
    let dial = Dial::at(ratio);
    let (c, clock) = build(config(), dial.clone());
    c.poll_once().await;
    (c, dial, clock)
}

pub fn request(peer: &str, tier: Tier, mbps: f64) -> SessionRequest {
    SessionRequest {
        peer_id: peer.into(),
        estimated_bandwidth_mbps: mbps,
        tier,
        p2p_attempted: true,
        route: RouteMetadata { store_id: "store-1".into(), ..RouteMetadata::default() },
    }
}
