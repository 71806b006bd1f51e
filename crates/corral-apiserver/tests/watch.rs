//! Resource-backed watchers and pushed notifications.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{assert_code, connect, context_with, seeded_store};
use corral_apiserver::ServerSettings;
use corral_apiserver::protocol::ServerMessage;
use corral_core::credentials::SecretHash;
use corral_core::state::{EntityRecord, EntityStore};
use corral_core::{ControllerMode, SharedControllerMode, Tag};
use secrecy::SecretString;

#[tokio::test]
async fn test_watch_status_pushes_changes_until_stopped() {
    let store = seeded_store();
    let ctx = context_with(
        Arc::clone(&store) as Arc<dyn EntityStore>,
        &SharedControllerMode::new(ControllerMode::Normal),
        ServerSettings::default(),
    );
    let (mut client, _server) = connect(&ctx);
    client.login_admin().await;

    let watch = client.call_simple("Client", 1, "WatchStatus").await.unwrap();
    let watcher_id = watch["watcher_id"].as_str().unwrap().to_string();

    store.upsert(EntityRecord::new(
        Tag::parse("user-carol").unwrap(),
        SecretHash::generate(&SecretString::from("pw".to_string())),
    ));
    let pushed = tokio::time::timeout(Duration::from_secs(5), client.notification())
        .await
        .expect("notification arrives")
        .expect("connection open");
    match pushed {
        ServerMessage::Notification {
            facade,
            resource_id,
            payload,
        } => {
            assert_eq!(facade, "StatusWatcher");
            assert_eq!(resource_id, watcher_id);
            assert_eq!(payload["changes"][0]["entity"], "user-carol");
        },
        other @ ServerMessage::Response { .. } => panic!("expected notification, got {other:?}"),
    }

    let next = client.request("StatusWatcher", 1, "Next").with_id(watcher_id.clone());
    let changes = client.call(next).await.unwrap();
    assert_eq!(changes["changes"][0]["entity"], "user-carol");
    assert_eq!(changes["missed"], false);

    let stop = client.request("StatusWatcher", 1, "Stop").with_id(watcher_id.clone());
    client.call(stop).await.unwrap();

    let next = client.request("StatusWatcher", 1, "Next").with_id(watcher_id);
    assert_code(&client.call(next).await, "unknown-id");
}

#[tokio::test]
async fn test_watcher_ids_are_session_scoped() {
    let (ctx, _mode) = common::context(ControllerMode::Normal);
    let (mut owner, _s1) = connect(&ctx);
    let (mut other, _s2) = connect(&ctx);
    owner.login_admin().await;
    other.login_admin().await;

    let watch = owner.call_simple("Client", 1, "WatchStatus").await.unwrap();
    let watcher_id = watch["watcher_id"].as_str().unwrap().to_string();

    let next = other.request("StatusWatcher", 1, "Next").with_id(watcher_id);
    assert_code(&other.call(next).await, "unknown-id");

    let missing_id = owner.call_simple("StatusWatcher", 1, "Next").await;
    assert_code(&missing_id, "unknown-id");
}
