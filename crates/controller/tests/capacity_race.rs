mod common;

use common::{build, config, request, Dial};
use controller::{AdmissionDecision, RejectReason};
use proptest::prelude::*;
use relay_core::Tier;
use std::sync::{Arc, Barrier};

fn race(cap: u32, tier: Tier, extra: usize) -> (usize, usize) {
    let mut cfg = config();
    match tier {
        Tier::Free => cfg.policy.entitlements.free.max_concurrent_sessions = cap,
        Tier::Basic => cfg.policy.entitlements.basic.max_concurrent_sessions = cap,
        Tier::Standard => cfg.policy.entitlements.standard.max_concurrent_sessions = cap,
        Tier::Premium => cfg.policy.entitlements.premium.max_concurrent_sessions = cap,
    }
    let (c, _clock) = build(cfg, Dial::at(0.10));
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    rt.block_on(c.poll_once());

    let n = cap as usize + extra;
    let barrier = Arc::new(Barrier::new(n));
    let handles: Vec<_> = (0..n)
        .map(|i| {
            let c = c.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                c.admission().request_session(&request(&format!("peer-{i}"), tier, 1.0))
            })
        })
        .collect();
    let decisions: Vec<AdmissionDecision> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let admitted = decisions.iter().filter(|d| d.is_admit()).count();
    let capped = decisions
        .iter()
        .filter(|d| matches!(d.reason(), Some(RejectReason::CapacityExceeded { .. })))
        .count();
    assert_eq!(c.registry().count_by_tier()[&tier], admitted);
    (admitted, capped)
}

#[test]
fn exactly_cap_admitted_under_contention() {
    let (admitted, capped) = race(5, Tier::Standard, 5);
    assert_eq!(admitted, 5);
    assert_eq!(capped, 5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]
    #[test]
    fn cap_holds_for_any_tier(cap in 1u32..12, tier_idx in 0usize..4) {
        let (admitted, capped) = race(cap, Tier::ALL[tier_idx], 5);
        prop_assert_eq!(admitted, cap as usize);
        prop_assert_eq!(capped, 5);
    }
}
