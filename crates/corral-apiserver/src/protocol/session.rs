//! Per-connection session state and request routing.
//!
//! A [`Session`] starts unauthenticated. The first Admin request fixes the
//! session's Admin version; `Admin.Login` then authenticates an entity and
//! installs a [`RootDispatcher`] whose restriction chain is chosen from the
//! controller mode at that moment. Every later call goes through that
//! dispatcher.
//!
//! # Login sequence
//!
//! 1. Reject if already authenticated ([`ApiError::AlreadyLoggedIn`]).
//! 2. Take a slot from the server-wide [`LoginRateLimiter`].
//! 3. Authenticate the credential.
//! 4. Read the controller mode once and build the restriction chain.
//! 5. Render the version's login result.
//! 6. Bind the entity to the session.
//!
//! # Invariants
//!
//! - [INV-SE-001] At most one entity ever authenticates a session.
//! - [INV-SE-002] A failed or abandoned login leaves the session exactly as
//!   it was; the entity is bound only after every fallible step.
//! - [INV-SE-003] The restriction chain does not change after login.

use std::fmt;
use std::sync::Arc;

use corral_core::Tag;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::admin::{ADMIN_FACADE, AdminHandler, LOGIN_METHOD, LoginRequest, LoginSummary};
use super::error::ApiError;
use super::messages::Request;
use super::notifier::Notifier;
use super::resources::ResourceRegistry;
use super::restrictions::RestrictionChain;
use super::root::{RootDispatcher, decode_params};
use crate::context::ServerContext;

/// State of one accepted connection.
pub struct Session {
    ctx: Arc<ServerContext>,
    connection_id: u64,
    cancel: CancellationToken,
    resources: Arc<ResourceRegistry>,
    notifier: Notifier,
    admin: Option<Arc<dyn AdminHandler>>,
    root: Option<RootDispatcher>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.connection_id)
            .field("admin_version", &self.admin_version())
            .field("entity", &self.entity())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates an unauthenticated session.
    ///
    /// `cancel` is the connection's token; a login waiting for a rate-limit
    /// slot gives up when it fires.
    #[must_use]
    pub fn new(
        ctx: Arc<ServerContext>,
        connection_id: u64,
        cancel: CancellationToken,
        notifier: Notifier,
    ) -> Self {
        Self {
            ctx,
            connection_id,
            cancel,
            resources: Arc::new(ResourceRegistry::new()),
            notifier,
            admin: None,
            root: None,
        }
    }

    /// Returns the connection id.
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Returns the authenticated entity, if any.
    #[must_use]
    pub fn entity(&self) -> Option<&Tag> {
        self.root.as_ref().map(RootDispatcher::entity)
    }

    /// Returns the Admin version fixed by the first Admin call.
    #[must_use]
    pub fn admin_version(&self) -> Option<u32> {
        self.admin.as_ref().map(|a| a.version())
    }

    /// Returns the dispatcher installed at login.
    #[must_use]
    pub const fn root(&self) -> Option<&RootDispatcher> {
        self.root.as_ref()
    }

    /// Returns the session's resource registry.
    #[must_use]
    pub const fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.resources
    }

    /// Handles one request.
    ///
    /// # Errors
    ///
    /// Any [`ApiError`]; the session stays usable afterwards.
    pub async fn handle(&mut self, request: Request) -> Result<Value, ApiError> {
        let Request {
            facade,
            version,
            id,
            method,
            params,
            ..
        } = request;

        if facade == ADMIN_FACADE {
            let admin = self.select_admin(version)?;
            if method != LOGIN_METHOD {
                return Err(ApiError::UnknownMethod {
                    facade,
                    version,
                    method,
                });
            }
            return self.login(admin, params).await;
        }

        match &self.root {
            Some(root) => root.call(&facade, version, &id, &method, params).await,
            None => Err(ApiError::NotLoggedIn),
        }
    }

    /// Stops every resource the session created. Runs once; later calls
    /// are no-ops.
    pub async fn close(&self) -> usize {
        self.resources.stop_all().await
    }

    fn select_admin(&mut self, version: u32) -> Result<Arc<dyn AdminHandler>, ApiError> {
        if let Some(admin) = &self.admin {
            if admin.version() == version {
                return Ok(Arc::clone(admin));
            }
            return Err(ApiError::UnsupportedVersion {
                facade: ADMIN_FACADE.to_string(),
                version,
            });
        }
        let admin: Arc<dyn AdminHandler> = Arc::from(self.ctx.admin().select(version)?);
        debug!(
            connection_id = self.connection_id,
            version, "admin version selected"
        );
        self.admin = Some(Arc::clone(&admin));
        Ok(admin)
    }

    async fn login(
        &mut self,
        admin: Arc<dyn AdminHandler>,
        params: Value,
    ) -> Result<Value, ApiError> {
        if let Some(entity) = self.entity() {
            debug!(
                connection_id = self.connection_id,
                entity = %entity,
                "login rejected, session already authenticated"
            );
            return Err(ApiError::AlreadyLoggedIn);
        }

        let request: LoginRequest = decode_params(params)?;
        let (credential, model_tag) = request.into_credential()?;
        admin.accept(&credential)?;
        let scheme = credential.scheme();

        let _slot = self.ctx.login_limiter().acquire(&self.cancel).await?;
        let require_lookup = model_tag.is_some();
        let authenticated = match self
            .ctx
            .authenticator()
            .authenticate(&credential, require_lookup)
            .await
        {
            Ok(authenticated) => authenticated,
            Err(err) => {
                let err = admin.present_error(err);
                info!(
                    connection_id = self.connection_id,
                    version = admin.version(),
                    scheme,
                    code = err.code(),
                    "login failed"
                );
                return Err(err);
            },
        };
        drop(credential);

        let mode = self.ctx.mode().current_mode();
        let root = RootDispatcher::new(
            Arc::clone(self.ctx.facades()),
            RestrictionChain::for_mode(mode),
            authenticated.entity.clone(),
            Arc::clone(&self.resources),
            self.notifier.clone(),
            self.connection_id,
        );
        let settings = self.ctx.settings();
        let summary = LoginSummary {
            entity: authenticated.entity,
            controller_tag: settings.controller_tag.clone(),
            model_tag,
            server_info: settings.server_info.clone(),
            servers: settings.api_addresses.clone(),
            facades: root.facades(),
            credentials_expiry: authenticated.expiry,
            mode,
        };
        let result = admin.login_result(&summary)?;

        info!(
            connection_id = self.connection_id,
            entity = %summary.entity,
            version = admin.version(),
            scheme,
            %mode,
            "login succeeded"
        );
        self.root = Some(root);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use corral_core::credentials::{Bakery, SecretHash};
    use corral_core::mode::FixedMode;
    use corral_core::state::{EntityRecord, InMemoryEntityStore};
    use corral_core::ControllerMode;
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::context::ServerSettings;
    use crate::protocol::root::{FacadeContext, FacadeRegistry, FacadeSpec};

    fn context(mode: ControllerMode) -> Arc<ServerContext> {
        let store = Arc::new(InMemoryEntityStore::with_records([EntityRecord::new(
            Tag::user("admin").unwrap(),
            SecretHash::generate(&SecretString::from("pw".to_string())),
        )]));
        let mut facades = FacadeRegistry::new();
        facades
            .register(
                FacadeSpec::builder("Pinger", 1, |_: &FacadeContext| Ok(()))
                    .method("Ping", |_: Arc<()>, (): ()| async move { Ok::<_, ApiError>(()) })
                    .build(),
            )
            .unwrap();
        Arc::new(ServerContext::new(
            ServerSettings::default(),
            store,
            Arc::new(FixedMode(mode)),
            Bakery::new([0u8; 32], "corral", "https://idm", [1u8; 32]),
            facades,
        ))
    }

    fn session(mode: ControllerMode) -> Session {
        let (notifier, _rx) = Notifier::channel();
        Session::new(context(mode), 1, CancellationToken::new(), notifier)
    }

    fn login(version: u32, tag: &str, password: &str) -> Request {
        Request::new(1, "Admin", version, "Login")
            .with_params(serde_json::to_value(LoginRequest::password(tag, password)).unwrap())
    }

    #[tokio::test]
    async fn test_calls_before_login_are_rejected() {
        let mut s = session(ControllerMode::Normal);
        assert_eq!(
            s.handle(Request::new(1, "Pinger", 1, "Ping")).await,
            Err(ApiError::NotLoggedIn)
        );
    }

    #[tokio::test]
    async fn test_login_binds_entity_once() {
        let mut s = session(ControllerMode::Normal);
        assert_eq!(
            s.handle(login(3, "user-admin", "wrong")).await,
            Err(ApiError::InvalidCredentials)
        );
        assert!(s.entity().is_none());

        let result = s.handle(login(3, "user-admin", "pw")).await.unwrap();
        assert_eq!(result["entity_tag"], json!("user-admin"));
        assert_eq!(s.entity(), Some(&Tag::user("admin").unwrap()));

        assert_eq!(
            s.handle(login(3, "user-admin", "pw")).await,
            Err(ApiError::AlreadyLoggedIn)
        );
        assert_eq!(s.entity(), Some(&Tag::user("admin").unwrap()));
        assert_eq!(
            s.handle(Request::new(2, "Pinger", 1, "Ping")).await,
            Ok(Value::Null)
        );
    }

    #[tokio::test]
    async fn test_admin_version_is_fixed_by_first_call() {
        let mut s = session(ControllerMode::Normal);
        assert!(matches!(
            s.handle(login(7, "user-admin", "pw")).await,
            Err(ApiError::UnsupportedVersion { version: 7, .. })
        ));
        assert_eq!(s.admin_version(), None);

        assert!(s.handle(login(0, "user-admin", "wrong")).await.is_err());
        assert_eq!(s.admin_version(), Some(0));
        assert!(matches!(
            s.handle(login(3, "user-admin", "pw")).await,
            Err(ApiError::UnsupportedVersion { version: 3, .. })
        ));
        let legacy = s.handle(login(0, "user-admin", "pw")).await.unwrap();
        assert_eq!(legacy, json!({"entity_tag": "user-admin", "servers": []}));
    }

    #[tokio::test]
    async fn test_unknown_admin_method() {
        let mut s = session(ControllerMode::Normal);
        assert!(matches!(
            s.handle(Request::new(1, "Admin", 3, "Logout")).await,
            Err(ApiError::UnknownMethod { .. })
        ));
    }

    #[tokio::test]
    async fn test_mode_is_reported_and_applied() {
        let mut s = session(ControllerMode::Upgrading);
        let result = s.handle(login(3, "user-admin", "pw")).await.unwrap();
        assert_eq!(result["controller_mode"], json!("upgrading"));
        assert_eq!(
            s.root().unwrap().chain().mode(),
            ControllerMode::Upgrading
        );
    }

    #[tokio::test]
    async fn test_cancelled_connection_abandons_login() {
        let (notifier, _rx) = Notifier::channel();
        let ctx = context(ControllerMode::Normal);
        let cancel = CancellationToken::new();
        let mut s = Session::new(Arc::clone(&ctx), 1, cancel.clone(), notifier);

        let mut held = Vec::new();
        for _ in 0..ctx.login_limiter().limit() {
            held.push(ctx.login_limiter().acquire(&CancellationToken::new()).await.unwrap());
        }
        cancel.cancel();
        assert_eq!(
            s.handle(login(3, "user-admin", "pw")).await,
            Err(ApiError::Cancelled)
        );
        assert!(s.entity().is_none());
    }
}
