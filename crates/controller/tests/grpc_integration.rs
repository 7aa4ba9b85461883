mod common;

use common::{build, config, Dial};
use controller::relay_v1::{relay_guard_client::RelayGuardClient, *};
use controller::RelayGuardService;
use futures_util::stream::StreamExt;
use tokio::net::TcpListener;
use tonic::transport::Server;

async fn spawn_server(ratio: f64) -> (String, tokio::task::JoinHandle<()>) {
    let (c, _clock) = build(config(), Dial::at(ratio));
    c.poll_once().await;
    let svc = RelayGuardService::new(c).into_server();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let h = tokio::spawn(async move {
        let stream = futures_util::stream::unfold(listener, |listener| async move {
            Some((listener.accept().await.ok()?.0, listener))
        })
        .filter_map(|s| async move { Some(Ok::<_, std::io::Error>(s)) });
        Server::builder().add_service(svc).serve_with_incoming(stream).await.unwrap();
    });
    (format!("http://{}", addr), h)
}

fn route() -> Option<Route> {
    Some(Route { store_id: "store-9".into(), range_start: Some(0), range_end: Some(1 << 20) })
}

#[tokio::test]
async fn request_heartbeat_end_roundtrip() {
    let (addr, _h) = spawn_server(0.20).await;
    let mut client = RelayGuardClient::connect(addr).await.unwrap();

    let resp = client
        .request_session(RequestSessionRequest {
            peer_id: "peer-a".into(),
            estimated_bandwidth_mbps: 40.0,
            tier: "basic".into(),
            p2p_attempted: false,
            route: route(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(resp.admitted);
    assert_eq!(resp.mode, "normal");
    let grant = resp.session.unwrap();
    assert_eq!(grant.granted_bandwidth_mbps, 25.0);
    assert_eq!(grant.expires_at_ms, None);

    let hb = client
        .heartbeat(HeartbeatRequest { peer_id: "peer-a".into(), route: route() })
        .await
        .unwrap()
        .into_inner();
    assert!(hb.known);
    let hb = client
        .heartbeat(HeartbeatRequest { peer_id: "peer-a".into(), route: None })
        .await
        .unwrap()
        .into_inner();
    assert!(!hb.known, "different route is a different session");

    let stats = client.get_stats(GetStatsRequest {}).await.unwrap().into_inner();
    assert_eq!(stats.total_sessions, 1);
    assert_eq!(stats.sessions_by_tier.get("basic"), Some(&1));
    assert_eq!(stats.sessions_by_tier.len(), 4);
    assert_eq!(stats.decisions.get("admitted"), Some(&1));
    assert!((stats.cost_ratio - 0.20).abs() < 1e-9);
    assert!(!stats.degraded);

    let ended = client
        .end_session(EndSessionRequest { peer_id: "peer-a".into() })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(ended.session_ids, vec![grant.session_id]);

    let health = client.get_health(GetHealthRequest {}).await.unwrap().into_inner();
    assert_eq!(health.active_sessions, 0);
    assert!((health.budget_used_percent - 20.0).abs() < 1e-9);
}

#[tokio::test]
async fn rejection_is_a_normal_response() {
    let (addr, _h) = spawn_server(0.90).await;
    let mut client = RelayGuardClient::connect(addr).await.unwrap();
    let resp = client
        .request_session(RequestSessionRequest {
            peer_id: "peer-b".into(),
            estimated_bandwidth_mbps: 10.0,
            tier: "standard".into(),
            p2p_attempted: true,
            route: route(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!resp.admitted);
    assert_eq!(resp.mode, "throttle");
    let rej = resp.rejection.unwrap();
    assert_eq!(rej.code, "tier_ineligible_for_mode");
    assert_eq!(rej.retry_hint, "upgrade_tier");
    assert!(!rej.message.is_empty());
}

#[tokio::test]
async fn unknown_tier_is_invalid_argument() {
    let (addr, _h) = spawn_server(0.20).await;
    let mut client = RelayGuardClient::connect(addr).await.unwrap();
    let err = client
        .request_session(RequestSessionRequest {
            peer_id: "peer-c".into(),
            estimated_bandwidth_mbps: 1.0,
            tier: "platinum".into(),
            p2p_attempted: true,
            route: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
}
