//! Login behaviour observed over a live connection.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    ADMIN, ADMIN_PASSWORD, MACHINE, MACHINE_NONCE, MACHINE_PASSWORD, assert_code, connect,
    context, context_with, seeded_store,
};
use corral_apiserver::ServerSettings;
use corral_apiserver::protocol::admin::LoginRequest;
use corral_core::state::{EntityRecord, EntityStore, InMemoryEntityStore, StoreChange, StoreError};
use corral_core::{ControllerMode, SharedControllerMode, Tag};
use serde_json::json;
use tokio::sync::{Semaphore, broadcast};

#[tokio::test]
async fn test_v3_login_reports_identity_and_facades() {
    let (ctx, _mode) = context(ControllerMode::Normal);
    let (mut client, _server) = connect(&ctx);

    let result = client.login_admin().await;
    assert_eq!(result["entity_tag"], ADMIN);
    assert_eq!(result["controller_tag"], ctx.settings().controller_tag.as_str());
    assert_eq!(result["controller_mode"], "normal");
    let names: Vec<&str> = result["facades"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Backups", "Client", "Pinger", "StatusWatcher"]);

    let unknown = client.call_simple("Client", 1, "NoSuchMethod").await;
    assert_code(&unknown, "unknown-method");
    let unknown = client.call_simple("NoSuchFacade", 1, "Ping").await;
    assert_code(&unknown, "unknown-method");

    client.call_simple("Pinger", 1, "Ping").await.unwrap();
}

#[tokio::test]
async fn test_v0_login_uses_legacy_result_shape() {
    let (ctx, _mode) = context(ControllerMode::Normal);
    let (mut client, _server) = connect(&ctx);

    let result = client
        .login(0, &LoginRequest::password(ADMIN, ADMIN_PASSWORD))
        .await
        .unwrap();
    assert_eq!(result["entity_tag"], ADMIN);
    assert!(result.get("facades").is_none());
    assert!(result.get("controller_tag").is_none());
}

#[tokio::test]
async fn test_invalid_credentials_leave_session_unauthenticated() {
    let (ctx, _mode) = context(ControllerMode::Normal);
    let (mut client, _server) = connect(&ctx);

    let wrong = client
        .login(3, &LoginRequest::password(ADMIN, "wrong password"))
        .await;
    assert_code(&wrong, "invalid-credentials");
    let unknown = client
        .login(3, &LoginRequest::password("user-nobody", "whatever"))
        .await;
    assert_code(&unknown, "invalid-credentials");
    let malformed = client
        .login(3, &LoginRequest::password("not a tag", "whatever"))
        .await;
    assert_code(&malformed, "invalid-credentials");

    let call = client.call_simple("Pinger", 1, "Ping").await;
    assert_code(&call, "not-logged-in");

    // A failed attempt does not consume the session.
    client.login_admin().await;
    client.call_simple("Pinger", 1, "Ping").await.unwrap();
}

#[tokio::test]
async fn test_calls_before_login_are_rejected() {
    let (ctx, _mode) = context(ControllerMode::Normal);
    let (mut client, _server) = connect(&ctx);

    for (facade, method) in [("Pinger", "Ping"), ("Client", "FullStatus"), ("Nope", "Nope")] {
        let result = client.call_simple(facade, 1, method).await;
        assert_code(&result, "not-logged-in");
    }
}

#[tokio::test]
async fn test_second_login_is_rejected_and_identity_kept() {
    let (ctx, _mode) = context(ControllerMode::Normal);
    let (mut client, _server) = connect(&ctx);
    client.login_admin().await;

    let again = client
        .login(
            3,
            &LoginRequest::password(MACHINE, MACHINE_PASSWORD).with_nonce(MACHINE_NONCE),
        )
        .await;
    assert_code(&again, "already-logged-in");

    let info = client.call_simple("Client", 1, "ModelInfo").await.unwrap();
    assert_eq!(info["requested_by"], ADMIN);
}

#[tokio::test]
async fn test_machine_login_requires_matching_nonce() {
    let (ctx, _mode) = context(ControllerMode::Normal);
    let (mut client, _server) = connect(&ctx);

    let missing = client
        .login(3, &LoginRequest::password(MACHINE, MACHINE_PASSWORD))
        .await;
    assert_code(&missing, "not-provisioned");
    let wrong = client
        .login(
            3,
            &LoginRequest::password(MACHINE, MACHINE_PASSWORD).with_nonce("nonce-9"),
        )
        .await;
    assert_code(&wrong, "not-provisioned");

    let ok = client
        .login(
            3,
            &LoginRequest::password(MACHINE, MACHINE_PASSWORD).with_nonce(MACHINE_NONCE),
        )
        .await
        .unwrap();
    assert_eq!(ok["entity_tag"], MACHINE);
}

#[tokio::test]
async fn test_unsupported_admin_version_in_every_mode() {
    for mode in [
        ControllerMode::Normal,
        ControllerMode::Upgrading,
        ControllerMode::RestoreInProgress,
        ControllerMode::AboutToRestore,
    ] {
        let (ctx, _mode) = context(mode);
        let (mut client, _server) = connect(&ctx);

        for version in [1, 2, 4, 99] {
            let result = client
                .login(version, &LoginRequest::password(ADMIN, ADMIN_PASSWORD))
                .await;
            assert_code(&result, "unsupported-version");
        }
        // Rejected versions do not fix the session's Admin version.
        client.login_admin().await;
    }
}

#[tokio::test]
async fn test_admin_version_is_fixed_by_first_admin_call() {
    let (ctx, _mode) = context(ControllerMode::Normal);
    let (mut client, _server) = connect(&ctx);

    let wrong = client
        .login(0, &LoginRequest::password(ADMIN, "wrong"))
        .await;
    assert_code(&wrong, "invalid-credentials");

    let other_version = client
        .login(3, &LoginRequest::password(ADMIN, ADMIN_PASSWORD))
        .await;
    assert_code(&other_version, "unsupported-version");

    client
        .login(0, &LoginRequest::password(ADMIN, ADMIN_PASSWORD))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_admin_method() {
    let (ctx, _mode) = context(ControllerMode::Normal);
    let (mut client, _server) = connect(&ctx);

    let result = client.call_simple("Admin", 3, "RedirectInfo").await;
    assert_code(&result, "unknown-method");
}

#[tokio::test]
async fn test_login_rejects_bad_params() {
    let (ctx, _mode) = context(ControllerMode::Normal);
    let (mut client, _server) = connect(&ctx);

    let request = client
        .request("Admin", 3, "Login")
        .with_params(json!({"auth_tag": ADMIN, "unexpected": true}));
    let result = client.call(request).await;
    assert_code(&result, "bad-request");

    let model = client
        .login(
            3,
            &LoginRequest::password(ADMIN, ADMIN_PASSWORD).with_model_tag("user-admin"),
        )
        .await;
    assert_code(&model, "bad-request");
}

/// Store whose lookups block until the test releases them.
struct GatedStore {
    inner: Arc<InMemoryEntityStore>,
    gate: Semaphore,
    lookups: AtomicUsize,
}

#[async_trait]
impl EntityStore for GatedStore {
    async fn lookup_entity(&self, tag: &Tag) -> Result<EntityRecord, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable {
                reason: "gate closed".to_string(),
            })?;
        permit.forget();
        self.inner.lookup_entity(tag).await
    }

    async fn entity_exists(&self, tag: &Tag) -> Result<bool, StoreError> {
        self.inner.entity_exists(tag).await
    }

    async fn list_entities(&self) -> Result<Vec<Tag>, StoreError> {
        self.inner.list_entities().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn test_login_rate_limit_blocks_excess_logins() {
    let store = Arc::new(GatedStore {
        inner: seeded_store(),
        gate: Semaphore::new(0),
        lookups: AtomicUsize::new(0),
    });
    let settings = ServerSettings {
        login_rate_limit: 1,
        ..ServerSettings::default()
    };
    let mode = SharedControllerMode::new(ControllerMode::Normal);
    let ctx = context_with(Arc::clone(&store) as Arc<dyn EntityStore>, &mode, settings);

    let (mut first, _s1) = connect(&ctx);
    let (mut second, _s2) = connect(&ctx);

    let first_login = tokio::spawn(async move {
        let result = first.login_admin().await;
        (first, result)
    });
    while store.lookups.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second_login = tokio::spawn(async move {
        let result = second.login_admin().await;
        (second, result)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        store.lookups.load(Ordering::SeqCst),
        1,
        "second login reached the store while the only slot was held"
    );
    assert!(!second_login.is_finished());

    store.gate.add_permits(2);
    let (_first, first_result) = first_login.await.unwrap();
    let (_second, second_result) = second_login.await.unwrap();
    assert_eq!(first_result["entity_tag"], ADMIN);
    assert_eq!(second_result["entity_tag"], ADMIN);
    assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.login_limiter().available(), 1);
}
