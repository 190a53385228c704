//! End-to-end presence over the WebSocket relay.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

use chapita::config::{PresenceConfig, RelayConfig};
use chapita::core::clock::SystemClock;
use chapita::identity::token::{issue_token, TokenClaims};
use chapita::identity::AuthConfig;
use chapita::presence::{LocalPlayer, PresenceSnapshot, PresenceSynchronizer};
use chapita::store::{player_path, profile_path, MemoryStore, RealtimeStore, RelayServer, RemoteStore};
use chapita::{Facing, GridPos, StoreError, StorePath};

const SECRET: &str = "relay-roundtrip-secret";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const WAIT: Duration = Duration::from_secs(5);

struct Relay {
    server: Arc<RelayServer>,
    url: String,
}

impl Relay {
    async fn start() -> Self {
        let config = RelayConfig {
            auth: AuthConfig::with_secret(SECRET),
            ..RelayConfig::default()
        };
        let server = Arc::new(RelayServer::new(config, Arc::new(MemoryStore::new())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        Self { server, url }
    }

    async fn connect(&self, identity: &str) -> RemoteStore {
        RemoteStore::connect(&self.url, &token(identity, SECRET), REQUEST_TIMEOUT)
            .await
            .unwrap()
    }
}

fn token(identity: &str, secret: &str) -> String {
    issue_token(&TokenClaims::new(identity, Duration::from_secs(3600)), secret).unwrap()
}

fn local(identity: &str, position: GridPos) -> LocalPlayer {
    LocalPlayer {
        identity: identity.to_string(),
        display_name: identity.to_string(),
        position,
        facing: Facing::Down,
    }
}

async fn wait_for<F>(states: &mut watch::Receiver<PresenceSnapshot>, mut done: F)
where
    F: FnMut(&PresenceSnapshot) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if done(&states.borrow_and_update()) {
                return;
            }
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_players_see_each_other_through_relay() {
    let relay = Relay::start().await;
    let ana_store: Arc<dyn RealtimeStore> = Arc::new(relay.connect("ana").await);
    let bo_store: Arc<dyn RealtimeStore> = Arc::new(relay.connect("bo").await);
    let clock = Arc::new(SystemClock::new());
    let config = PresenceConfig::default();

    let ana = PresenceSynchronizer::start(ana_store, clock.clone(), config.clone(), local("ana", GridPos::new(5, 5))).unwrap();
    let mut bo = PresenceSynchronizer::start(bo_store, clock, config, local("bo", GridPos::new(8, 8))).unwrap();
    bo.subscribe_remote_states(|_| {}).await.unwrap();
    let mut states = bo.remote_states();

    wait_for(&mut states, |s| s.get("ana").is_some_and(|v| v.record.position == GridPos::new(5, 5))).await;
    assert!(!states.borrow().contains("bo"));

    ana.publish_local_state(GridPos::new(6, 5), Facing::Right, true);
    wait_for(&mut states, |s| {
        s.get("ana").is_some_and(|v| v.record.position == GridPos::new(6, 5) && v.display_moving)
    })
    .await;
    assert_eq!(states.borrow().get("ana").unwrap().display_facing, Facing::Right);

    ana.teardown().await;
    wait_for(&mut states, |s| !s.contains("ana")).await;
    bo.teardown().await;
    assert!(relay.server.store().snapshot(&player_path("bo").unwrap()).is_none());
}

#[tokio::test]
async fn test_writes_limited_to_own_records() {
    let relay = Relay::start().await;
    let ana = relay.connect("ana").await;
    let bo = relay.connect("bo").await;
    assert_eq!(ana.identity(), "ana");

    let denied = ana.write(&player_path("bo").unwrap(), json!({"displayName": "not bo"})).await;
    assert!(matches!(denied, Err(StoreError::PermissionDenied(_))));
    let denied = ana.merge(&StorePath::parse("online_players").unwrap(), json!({"bo": null})).await;
    assert!(matches!(denied, Err(StoreError::PermissionDenied(_))));

    ana.write(&profile_path("ana").unwrap(), json!({"username": "ana"})).await.unwrap();
    let read = bo.read(&profile_path("ana").unwrap()).await.unwrap();
    assert_eq!(read, Some(json!({"username": "ana"})));
    assert!(bo.server_time().await.unwrap() > 0);
}

#[tokio::test]
async fn test_disconnect_removes_registered_record() {
    let relay = Relay::start().await;
    let ana = relay.connect("ana").await;
    let bo = relay.connect("bo").await;
    let path = player_path("ana").unwrap();

    assert!(ana.on_disconnect_remove(&path).await.unwrap());
    ana.write(&path, json!({"displayName": "ana"})).await.unwrap();

    let mut subscription = bo.subscribe(&path).await.unwrap();
    let first = tokio::time::timeout(WAIT, subscription.updates.recv()).await.unwrap();
    assert_eq!(first, Some(Some(json!({"displayName": "ana"}))));

    drop(ana);
    let next = tokio::time::timeout(WAIT, subscription.updates.recv()).await.unwrap();
    assert_eq!(next, Some(None));
    bo.unsubscribe(subscription.handle).await.unwrap();
}

#[tokio::test]
async fn test_rejects_foreign_token_then_shuts_down() {
    let relay = Relay::start().await;
    let forged = RemoteStore::connect(&relay.url, &token("ana", "some-other-secret"), REQUEST_TIMEOUT).await;
    assert!(matches!(forged, Err(StoreError::PermissionDenied(_))));

    let bo = relay.connect("bo").await;
    relay.server.shutdown();
    tokio::time::timeout(WAIT, async {
        while !bo.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(bo.read(&profile_path("bo").unwrap()).await, Err(StoreError::Disconnected)));
}
