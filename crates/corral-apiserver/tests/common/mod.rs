//! Shared harness for the integration tests: a seeded server context and a
//! framed client over an in-memory duplex transport.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use corral_apiserver::facades::{RestoreCoordinator, standard_facades};
use corral_apiserver::protocol::admin::LoginRequest;
use corral_apiserver::protocol::{ErrorBody, Request, ServerMessage, frame_codec, serve_connection};
use corral_apiserver::{ServerContext, ServerSettings};
use corral_core::credentials::{Bakery, SecretHash};
use corral_core::state::{EntityRecord, EntityStore, InMemoryEntityStore};
use corral_core::{ControllerMode, SharedControllerMode, Tag};
use futures::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

pub const ROOT_KEY: [u8; 32] = [7u8; 32];
pub const IDENTITY_KEY: [u8; 32] = [9u8; 32];
pub const IDENTITY_LOCATION: &str = "https://identity.test";

pub const ADMIN: &str = "user-admin";
pub const ADMIN_PASSWORD: &str = "correct horse";
pub const MACHINE: &str = "machine-0";
pub const MACHINE_PASSWORD: &str = "agent-secret";
pub const MACHINE_NONCE: &str = "nonce-0";

fn hash(secret: &str) -> SecretHash {
    SecretHash::generate(&SecretString::from(secret.to_string()))
}

/// Store holding an admin user and a provisioned machine.
pub fn seeded_store() -> Arc<InMemoryEntityStore> {
    Arc::new(InMemoryEntityStore::with_records([
        EntityRecord::new(Tag::parse(ADMIN).unwrap(), hash(ADMIN_PASSWORD)),
        EntityRecord::new(Tag::parse(MACHINE).unwrap(), hash(MACHINE_PASSWORD))
            .with_nonce(MACHINE_NONCE),
    ]))
}

pub fn bakery() -> Bakery {
    Bakery::new(ROOT_KEY, "corral", IDENTITY_LOCATION, IDENTITY_KEY)
}

/// Builds a context over `store` with the built-in facades.
pub fn context_with(
    store: Arc<dyn EntityStore>,
    mode: &SharedControllerMode,
    settings: ServerSettings,
) -> Arc<ServerContext> {
    let restore = Arc::new(RestoreCoordinator::new(mode.clone()));
    let facades = standard_facades(
        Arc::clone(&store),
        settings.controller_tag.clone(),
        restore,
    )
    .unwrap();
    Arc::new(ServerContext::new(
        settings,
        store,
        Arc::new(mode.clone()),
        bakery(),
        facades,
    ))
}

/// Builds a context over the seeded store, starting in `mode`.
pub fn context(mode: ControllerMode) -> (Arc<ServerContext>, SharedControllerMode) {
    let shared = SharedControllerMode::new(mode);
    let ctx = context_with(seeded_store(), &shared, ServerSettings::default());
    (ctx, shared)
}

/// A connected test client.
pub struct Client<T> {
    framed: Framed<T, LengthDelimitedCodec>,
    next_request_id: u64,
    notifications: VecDeque<ServerMessage>,
}

/// Serves a new in-memory connection and returns the client end.
pub fn connect(ctx: &Arc<ServerContext>) -> (Client<tokio::io::DuplexStream>, JoinHandle<()>) {
    connect_with_shutdown(ctx, CancellationToken::new())
}

pub fn connect_with_shutdown(
    ctx: &Arc<ServerContext>,
    shutdown: CancellationToken,
) -> (Client<tokio::io::DuplexStream>, JoinHandle<()>) {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let handle = tokio::spawn(serve_connection(Arc::clone(ctx), server_io, shutdown));
    (Client::new(client_io), handle)
}

impl<T: AsyncRead + AsyncWrite + Unpin> Client<T> {
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, frame_codec()),
            next_request_id: 0,
            notifications: VecDeque::new(),
        }
    }

    /// Sends a request without waiting for the reply. Returns its id.
    pub async fn send(&mut self, request: Request) -> u64 {
        let id = request.request_id;
        self.framed.send(request.encode().unwrap()).await.unwrap();
        id
    }

    /// Builds a request with a fresh id.
    pub fn request(&mut self, facade: &str, version: u32, method: &str) -> Request {
        self.next_request_id += 1;
        Request::new(self.next_request_id, facade, version, method)
    }

    /// Waits for the response to `request_id`, queueing notifications.
    pub async fn response(&mut self, request_id: u64) -> Result<Value, ErrorBody> {
        loop {
            match self.recv().await.expect("connection closed before response") {
                ServerMessage::Response {
                    request_id: id,
                    result,
                    error,
                } if id == request_id => {
                    return match error {
                        Some(error) => Err(error),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                },
                ServerMessage::Response { .. } => panic!("response out of order"),
                notification @ ServerMessage::Notification { .. } => {
                    self.notifications.push_back(notification);
                },
            }
        }
    }

    /// Sends a request and waits for its response.
    pub async fn call(&mut self, request: Request) -> Result<Value, ErrorBody> {
        let id = self.send(request).await;
        self.response(id).await
    }

    pub async fn call_simple(
        &mut self,
        facade: &str,
        version: u32,
        method: &str,
    ) -> Result<Value, ErrorBody> {
        let request = self.request(facade, version, method);
        self.call(request).await
    }

    pub async fn login(&mut self, version: u32, login: &LoginRequest) -> Result<Value, ErrorBody> {
        let request = self
            .request("Admin", version, "Login")
            .with_params(serde_json::to_value(login).unwrap());
        self.call(request).await
    }

    pub async fn login_admin(&mut self) -> Value {
        self.login(3, &LoginRequest::password(ADMIN, ADMIN_PASSWORD))
            .await
            .expect("admin login failed")
    }

    /// Next message of any kind; `None` once the server closed the stream.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        match self.framed.next().await? {
            Ok(frame) => Some(ServerMessage::decode(&frame).unwrap()),
            Err(_) => None,
        }
    }

    /// Next notification, from the queue or the wire.
    pub async fn notification(&mut self) -> Option<ServerMessage> {
        if let Some(queued) = self.notifications.pop_front() {
            return Some(queued);
        }
        self.recv().await
    }
}

/// Asserts that `result` failed with wire code `code`.
#[track_caller]
pub fn assert_code(result: &Result<Value, ErrorBody>, code: &str) {
    match result {
        Err(body) => assert_eq!(body.code, code, "unexpected error: {body:?}"),
        Ok(value) => panic!("expected {code}, got success: {value}"),
    }
}
