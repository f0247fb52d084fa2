use std::time::Duration;

use livestatus::Request;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::test_util::{
    setup_test_logging, test_config, wait_until, MockSite, MockSiteState,
};
use crate::http_tunnel::SubPeerInfo;
use crate::peer::PeerState;
use crate::query::respond;
use crate::session::Session;

async fn start_session_with_mock(
    dir: &tempfile::TempDir,
    state: MockSiteState,
) -> (std::sync::Arc<Session>, MockSite) {
    let mock = MockSite::start(dir.path(), "mock1", state);
    let config = test_config(vec![], &[("p1", mock.source())]);
    let session = Session::new(config).unwrap();
    session.start().await.unwrap();
    (session, mock)
}

async fn wait_for_peer_up(session: &Session, id: &str) {
    wait_until("peer up", Duration::from_secs(5), || {
        session
            .peer(id)
            .map(|p| p.state() == PeerState::Up)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_hosts_over_frontend_socket_with_fixed16() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let listen = dir.path().join("frontend.sock").display().to_string();

    let mock = MockSite::start(
        dir.path(),
        "mock1",
        MockSiteState::with_hosts(&[("a", 0), ("b", 0), ("c", 0)]),
    );
    let config = test_config(vec![listen.clone()], &[("p1", mock.source())]);
    let session = Session::new(config).unwrap();
    session.start().await.unwrap();
    wait_for_peer_up(&session, "p1").await;

    let mut client = UnixStream::connect(&listen).await.unwrap();
    client
        .write_all(b"GET hosts\nColumns: name state\nResponseHeader: fixed16\n\n")
        .await
        .unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();

    let body = b"a;0\nb;0\nc;0\n";
    let mut expected = format!("200 {:>11}\n", body.len()).into_bytes();
    expected.extend_from_slice(body);
    assert_eq!(
        String::from_utf8_lossy(&reply),
        String::from_utf8_lossy(&expected)
    );

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_count_over_filtered_services() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut state = MockSiteState::with_hosts(&[("testhost_1", 0), ("other", 0)]);
    let mut services: Vec<(&str, &str, i64)> = Vec::new();
    let names = [
        "svc_0", "svc_1", "svc_2", "svc_3", "svc_4", "svc_5", "svc_6", "svc_7", "svc_8", "svc_9",
    ];
    for (i, name) in names.iter().enumerate() {
        services.push(("testhost_1", name, if i < 3 { 2 } else { 0 }));
    }
    services.push(("other", "svc_other", 2));
    state.add_services(&services);
    let (session, _mock) = start_session_with_mock(&dir, state).await;
    wait_for_peer_up(&session, "p1").await;

    let req = Request::parse(
        "GET services\nFilter: host_name = testhost_1\nStats: state = 2\nOutputFormat: json",
    )
    .unwrap();
    let (code, body) = respond(&session, &req).await.unwrap();
    assert_eq!(code, 200);
    assert_eq!(String::from_utf8_lossy(&body), "[[3]]\n");

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn broken_commands_are_relayed_and_peer_stays_up() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut state = MockSiteState::with_hosts(&[("a", 0)]);
    state.broken_commands = true;
    let (session, _mock) = start_session_with_mock(&dir, state).await;
    wait_for_peer_up(&session, "p1").await;

    let req = Request::parse("COMMAND [0] test_broken").unwrap();
    let (code, body) = respond(&session, &req).await.unwrap();
    assert_eq!(code, 200);
    assert_eq!(String::from_utf8_lossy(&body), "400: command broken\n");

    // An accepted command produces no reply at all.
    let req = Request::parse("COMMAND [0] test_ok").unwrap();
    let (_, body) = respond(&session, &req).await.unwrap();
    assert!(body.is_empty());

    // The failing command must not degrade the peer.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(session.peer("p1").unwrap().state(), PeerState::Up);

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_peer_lands_in_failed_map_not_in_status_code() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nowhere.sock").display().to_string();
    let config = test_config(vec![], &[("p1", missing)]);
    let session = Session::new(config).unwrap();
    session.start().await.unwrap();

    let req = Request::parse("GET status\nColumns: program_start\nOutputFormat: wrapped_json")
        .unwrap();
    let (code, body) = respond(&session, &req).await.unwrap();
    assert_eq!(code, 200);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["data"].as_array().unwrap().len(), 0);
    assert!(parsed["failed"]["p1"].is_string());

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_condition_times_out_without_error() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut state = MockSiteState::default();
    state.set_program_start(1700000000);
    state.tables.insert("hosts".into(), vec![]);
    let (session, _mock) = start_session_with_mock(&dir, state).await;
    wait_for_peer_up(&session, "p1").await;

    let req = Request::parse(
        "GET hosts\nColumns: name\nWaitCondition: name = newhost\nWaitTimeout: 500",
    )
    .unwrap();
    let started = std::time::Instant::now();
    let (code, body) = respond(&session, &req).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(code, 200);
    assert!(body.is_empty());
    assert!(
        elapsed >= Duration::from_millis(400) && elapsed <= Duration::from_millis(1500),
        "elapsed {elapsed:?}"
    );

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_condition_fires_when_the_host_appears() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut state = MockSiteState::default();
    state.set_program_start(1700000000);
    state.tables.insert("hosts".into(), vec![]);
    let (session, mock) = start_session_with_mock(&dir, state).await;
    wait_for_peer_up(&session, "p1").await;

    let query = tokio::spawn({
        let session = session.clone();
        async move {
            let req = Request::parse(
                "GET hosts\nColumns: name\nWaitCondition: name = newhost\nWaitTimeout: 8000",
            )
            .unwrap();
            respond(&session, &req).await.unwrap()
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    {
        let mut state = mock.state.lock();
        state.tables.insert(
            "hosts".into(),
            vec![serde_json::json!({
                "name": "newhost",
                "state": 0,
                "has_been_checked": 1,
                "last_check": 1700000200,
                "last_state_change": 1700000200,
                "contacts": ["admin"],
            })],
        );
        // New objects only exist after a core restart, which also forces
        // the proxy's next refresh to be a full one.
        state.set_program_start(1700000999);
    }

    let (code, body) = tokio::time::timeout(Duration::from_secs(6), query)
        .await
        .expect("query did not return in time")
        .unwrap();
    assert_eq!(code, 200);
    assert_eq!(String::from_utf8_lossy(&body), "newhost\n");

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_preserves_peer_order_and_sort_is_global() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mock1 = MockSite::start(
        dir.path(),
        "mock1",
        MockSiteState::with_hosts(&[("b", 0), ("d", 1)]),
    );
    let mock2 = MockSite::start(
        dir.path(),
        "mock2",
        MockSiteState::with_hosts(&[("a", 0), ("c", 1)]),
    );
    let config = test_config(
        vec![],
        &[("p1", mock1.source()), ("p2", mock2.source())],
    );
    let session = Session::new(config).unwrap();
    session.start().await.unwrap();
    wait_for_peer_up(&session, "p1").await;
    wait_for_peer_up(&session, "p2").await;

    let req = Request::parse("GET hosts\nColumns: name").unwrap();
    let (_, body) = respond(&session, &req).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&body), "b\nd\na\nc\n");

    let req = Request::parse("GET hosts\nColumns: name\nSort: name asc").unwrap();
    let (_, body) = respond(&session, &req).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&body), "a\nb\nc\nd\n");

    // Backends header restricts the peer set.
    let req = Request::parse("GET hosts\nColumns: name\nBackends: p2").unwrap();
    let (_, body) = respond(&session, &req).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&body), "a\nc\n");

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_adds_and_keeps_peers() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mock1 = MockSite::start(dir.path(), "mock1", MockSiteState::with_hosts(&[("a", 0)]));
    let mock2 = MockSite::start(dir.path(), "mock2", MockSiteState::with_hosts(&[("b", 0)]));

    let config = test_config(vec![], &[("p1", mock1.source())]);
    let session = Session::new(config).unwrap();
    session.start().await.unwrap();
    wait_for_peer_up(&session, "p1").await;
    let p1_before = session.peer("p1").unwrap();

    let new_config = test_config(
        vec![],
        &[("p1", mock1.source()), ("p2", mock2.source())],
    );
    session.reload(new_config).await.unwrap();

    let req = Request::parse("GET backends\nColumns: peer_key").unwrap();
    let (code, body) = respond(&session, &req).await.unwrap();
    assert_eq!(code, 200);
    assert_eq!(String::from_utf8_lossy(&body), "p1\np2\n");

    // The unchanged peer kept its identity (and with it, its data).
    assert!(std::sync::Arc::ptr_eq(
        &p1_before,
        &session.peer("p1").unwrap()
    ));

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn federation_children_follow_their_parent() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mock = MockSite::start(dir.path(), "mock1", MockSiteState::with_hosts(&[("a", 0)]));
    let config = test_config(vec![], &[("p1", mock.source())]);
    let session = Session::new(config).unwrap();
    session.start().await.unwrap();
    let parent = session.peer("p1").unwrap();

    let announce = |id: &str, name: &str| SubPeerInfo {
        id: id.to_string(),
        name: name.to_string(),
        section: String::new(),
    };
    session
        .sync_sub_peers(&parent, vec![announce("alpha", "Alpha"), announce("beta", "Beta")])
        .unwrap();

    let ids: Vec<String> = session.peers().iter().map(|p| p.id.clone()).collect();
    assert_eq!(ids, vec!["p1", "p1/alpha", "p1/beta"]);
    assert_eq!(
        session.peer("p1/alpha").unwrap().parent_id.as_deref(),
        Some("p1")
    );

    // A later announcement without beta drops it.
    session
        .sync_sub_peers(&parent, vec![announce("alpha", "Alpha")])
        .unwrap();
    assert!(session.peer("p1/beta").is_none());

    // Removing the parent removes the remaining child with it.
    session.reload(test_config(vec![], &[])).await.unwrap();
    assert!(session.peer("p1").is_none());
    assert!(session.peer("p1/alpha").is_none());

    session.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_user_restricts_visibility() {
    setup_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut state = MockSiteState::with_hosts(&[("a", 0)]);
    // Host b belongs to someone else.
    state.tables.get_mut("hosts").unwrap().push(serde_json::json!({
        "name": "b",
        "state": 0,
        "has_been_checked": 1,
        "last_check": 1700000100,
        "last_state_change": 1700000100,
        "contacts": ["operator"],
    }));
    let (session, _mock) = start_session_with_mock(&dir, state).await;
    wait_for_peer_up(&session, "p1").await;

    let req = Request::parse("GET hosts\nColumns: name\nAuthUser: admin").unwrap();
    let (_, body) = respond(&session, &req).await.unwrap();
    assert_eq!(String::from_utf8_lossy(&body), "a\n");

    session.stop().await;
}
