//! Live relay sessions.
//!
//! All reads and writes go through one lock, so per-tier caps hold exactly even
//! when admissions race.

use policy::TierPolicy;
use relay_core::{Clock, RouteMetadata, Session, SessionKey, Tier};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("tier {tier} is at its limit of {limit} concurrent sessions")]
    CapacityExceeded { tier: Tier, limit: u32 },
    #[error("peer {peer_id} already holds a session for this route")]
    DuplicatePeer { peer_id: String },
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionKey, Session>,
    per_tier: BTreeMap<Tier, usize>,
}

impl RegistryState {
    fn remove_where<F>(&mut self, mut pred: F) -> Vec<Session>
    where
        F: FnMut(&Session) -> bool,
    {
        let keys: Vec<SessionKey> =
            self.sessions.iter().filter(|(_, s)| pred(s)).map(|(k, _)| k.clone()).collect();
        let mut removed = Vec::with_capacity(keys.len());
        for k in keys {
            if let Some(s) = self.sessions.remove(&k) {
                if let Some(n) = self.per_tier.get_mut(&s.tier) {
                    *n = n.saturating_sub(1);
                }
                removed.push(s);
            }
        }
        removed.sort_by_key(|s| s.allocated_at_ms);
        removed
    }
}

/// Owner of every live [`Session`].
pub struct SessionRegistry {
    policy: Arc<TierPolicy>,
    clock: Arc<dyn Clock>,
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new(policy: Arc<TierPolicy>, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock, state: RwLock::new(RegistryState::default()) }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `session` if its tier has room and the peer has no session on the same route.
    pub fn admit(&self, session: Session) -> Result<Session, RegistryError> {
        let limit = self.policy.entitlement(session.tier).max_concurrent_sessions;
        let key = session.key();
        let mut st = self.write();
        if st.sessions.contains_key(&key) {
            return Err(RegistryError::DuplicatePeer { peer_id: session.peer_id });
        }
        let count = st.per_tier.entry(session.tier).or_insert(0);
        if *count >= limit as usize {
            return Err(RegistryError::CapacityExceeded { tier: session.tier, limit });
        }
        *count += 1;
        st.sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Remove every session held by `peer_id`.
    pub fn terminate(&self, peer_id: &str) -> Vec<Session> {
        self.write().remove_where(|s| s.peer_id == peer_id)
    }

    /// Remove every session matching `pred`, oldest first.
    pub fn sweep<F>(&self, pred: F) -> Vec<Session>
    where
        F: FnMut(&Session) -> bool,
    {
        self.write().remove_where(pred)
    }

    pub fn reap_expired(&self) -> Vec<Session> {
        let now = self.clock.now_ms();
        self.sweep(|s| s.is_expired(now))
    }

    /// Remove sessions whose last activity is at least `idle_timeout` old.
    pub fn reap_idle(&self, idle_timeout: Duration) -> Vec<Session> {
        let now = self.clock.now_ms();
        let idle_ms = u64::try_from(idle_timeout.as_millis()).unwrap_or(u64::MAX);
        self.sweep(|s| now.saturating_sub(s.last_activity_ms) >= idle_ms)
    }

    pub fn terminate_all(&self) -> Vec<Session> {
        self.sweep(|_| true)
    }

    /// Refresh `last_activity`; false when no such session exists.
    pub fn record_activity(&self, peer_id: &str, route: &RouteMetadata) -> bool {
        let key = SessionKey { peer_id: peer_id.to_string(), route: route.clone() };
        let now = self.clock.now_ms();
        match self.write().sessions.get_mut(&key) {
            Some(s) => {
                s.last_activity_ms = s.last_activity_ms.max(now);
                true
            }
            None => false,
        }
    }

    /// Snapshot of live sessions, oldest first.
    pub fn list_active(&self) -> Vec<Session> {
        let mut out: Vec<Session> = self.read().sessions.values().cloned().collect();
        out.sort_by_key(|s| s.allocated_at_ms);
        out
    }

    /// Live session count per tier; every tier is present.
    pub fn count_by_tier(&self) -> BTreeMap<Tier, usize> {
        let st = self.read();
        Tier::ALL.iter().map(|t| (*t, st.per_tier.get(t).copied().unwrap_or(0))).collect()
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::VirtualClock;

    fn registry() -> (SessionRegistry, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new(1_000));
        (SessionRegistry::new(Arc::new(TierPolicy::default()), clock.clone()), clock)
    }

    fn session(peer: &str, tier: Tier, store: &str, at: u64) -> Session {
        Session {
            session_id: format!("s-{peer}-{store}"),
            peer_id: peer.into(),
            tier,
            requested_bandwidth_mbps: 5.0,
            granted_bandwidth_mbps: 5.0,
            allocated_at_ms: at,
            expires_at_ms: None,
            last_activity_ms: at,
            route: RouteMetadata { store_id: store.into(), ..RouteMetadata::default() },
        }
    }

    #[test]
    fn free_tier_cap_is_one() {
        let (r, _) = registry();
        r.admit(session("a", Tier::Free, "x", 1)).unwrap();
        let err = r.admit(session("b", Tier::Free, "x", 2)).unwrap_err();
        assert_eq!(err, RegistryError::CapacityExceeded { tier: Tier::Free, limit: 1 });
        r.admit(session("b", Tier::Basic, "x", 2)).unwrap();
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn duplicate_route_rejected_but_other_store_allowed() {
        let (r, _) = registry();
        r.admit(session("p", Tier::Premium, "x", 1)).unwrap();
        assert!(matches!(
            r.admit(session("p", Tier::Premium, "x", 2)),
            Err(RegistryError::DuplicatePeer { .. })
        ));
        r.admit(session("p", Tier::Premium, "y", 3)).unwrap();
        assert_eq!(r.terminate("p").len(), 2);
        assert!(r.is_empty());
    }

    #[test]
    fn counts_cover_every_tier_and_release_on_removal() {
        let (r, _) = registry();
        r.admit(session("a", Tier::Standard, "x", 1)).unwrap();
        let counts = r.count_by_tier();
        assert_eq!(counts.len(), 4);
        assert_eq!(counts[&Tier::Standard], 1);
        assert_eq!(counts[&Tier::Free], 0);
        r.terminate_all();
        assert_eq!(r.count_by_tier()[&Tier::Standard], 0);
    }

    #[test]
    fn reap_expired_uses_clock() {
        let (r, clock) = registry();
        let mut s = session("a", Tier::Basic, "x", 1_000);
        s.expires_at_ms = Some(2_000);
        r.admit(s).unwrap();
        r.admit(session("b", Tier::Basic, "x", 1_000)).unwrap();
        clock.set_ms(1_999);
        assert!(r.reap_expired().is_empty());
        clock.set_ms(2_000);
        let gone = r.reap_expired();
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].peer_id, "a");
    }

    #[test]
    fn activity_defers_idle_reap() {
        let (r, clock) = registry();
        r.admit(session("a", Tier::Basic, "x", 1_000)).unwrap();
        r.admit(session("b", Tier::Basic, "x", 1_000)).unwrap();
        clock.advance_ms(50_000);
        let route = RouteMetadata { store_id: "x".into(), ..RouteMetadata::default() };
        assert!(r.record_activity("a", &route));
        assert!(!r.record_activity("zzz", &route));
        clock.advance_ms(20_000);
        let idle = r.reap_idle(Duration::from_secs(60));
        assert_eq!(idle.iter().map(|s| s.peer_id.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(r.len(), 1);
    }
}
