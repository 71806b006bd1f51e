//! Process-wide server state shared by every connection.
//!
//! A [`ServerContext`] is built once at startup and handed to each
//! connection behind an `Arc`. Nothing in it is mutable except the login
//! semaphore and the connection counter, both of which are safe for
//! concurrent use without locks. The controller mode is reached only through
//! the read-only [`ModeSource`] seam, so tests substitute a fixed mode
//! instead of mutating shared state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use corral_core::config::{ConfigError, ServerConfig};
use corral_core::credentials::Bakery;
use corral_core::state::EntityStore;
use corral_core::{ModeSource, Tag};

use crate::auth::{Authenticator, Clock};
use crate::protocol::admin::AdminFacadeRegistry;
use crate::protocol::rate_limit::LoginRateLimiter;
use crate::protocol::root::FacadeRegistry;

/// Construction-time settings. Never renegotiated per connection.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// This controller's tag, reported at login.
    pub controller_tag: Tag,
    /// Server identification string, reported at login.
    pub server_info: String,
    /// API addresses advertised at login.
    pub api_addresses: Vec<String>,
    /// Maximum logins in flight across the server.
    pub login_rate_limit: usize,
    /// Idle clients are disconnected after this long.
    pub client_ping_interval: Duration,
    /// How often each connection pings the cluster-state store.
    pub store_ping_interval: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ServerSettings {
    /// Extracts the settings from a validated configuration.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            controller_tag: config.controller_tag.clone(),
            server_info: config.server_info.clone(),
            api_addresses: config.api_addresses.clone(),
            login_rate_limit: config.login_rate_limit,
            client_ping_interval: config.client_ping_interval(),
            store_ping_interval: config.store_ping_interval(),
            max_connections: config.max_connections,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// State shared by every connection of one server.
pub struct ServerContext {
    authenticator: Authenticator,
    admin: AdminFacadeRegistry,
    facades: Arc<FacadeRegistry>,
    mode: Arc<dyn ModeSource>,
    login_limiter: LoginRateLimiter,
    store: Arc<dyn EntityStore>,
    settings: ServerSettings,
    next_connection_id: AtomicU64,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("admin", &self.admin)
            .field("mode", &self.mode.current_mode())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// Creates a context with the standard Admin versions.
    #[must_use]
    pub fn new(
        settings: ServerSettings,
        store: Arc<dyn EntityStore>,
        mode: Arc<dyn ModeSource>,
        bakery: Bakery,
        facades: FacadeRegistry,
    ) -> Self {
        Self {
            authenticator: Authenticator::new(Arc::clone(&store), Arc::new(bakery)),
            admin: AdminFacadeRegistry::standard(),
            facades: Arc::new(facades),
            mode,
            login_limiter: LoginRateLimiter::new(settings.login_rate_limit),
            store,
            settings,
            next_connection_id: AtomicU64::new(0),
        }
    }

    /// Creates a context from a configuration file's contents.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for malformed macaroon keys.
    pub fn from_config(
        config: &ServerConfig,
        store: Arc<dyn EntityStore>,
        mode: Arc<dyn ModeSource>,
        facades: FacadeRegistry,
    ) -> Result<Self, ConfigError> {
        let bakery = config.macaroon.bakery()?;
        Ok(Self::new(
            ServerSettings::from_config(config),
            store,
            mode,
            bakery,
            facades,
        ))
    }

    /// Replaces the Admin version table.
    #[must_use]
    pub fn with_admin_registry(mut self, admin: AdminFacadeRegistry) -> Self {
        self.admin = admin;
        self
    }

    /// Replaces the clock used to check `time-before` caveats.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.authenticator = self.authenticator.with_clock(clock);
        self
    }

    /// Returns the credential authenticator.
    #[must_use]
    pub const fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// Returns the Admin version table.
    #[must_use]
    pub const fn admin(&self) -> &AdminFacadeRegistry {
        &self.admin
    }

    /// Returns the facade registry.
    #[must_use]
    pub const fn facades(&self) -> &Arc<FacadeRegistry> {
        &self.facades
    }

    /// Returns the controller mode source.
    #[must_use]
    pub fn mode(&self) -> &dyn ModeSource {
        self.mode.as_ref()
    }

    /// Returns the server-wide login limiter.
    #[must_use]
    pub const fn login_limiter(&self) -> &LoginRateLimiter {
        &self.login_limiter
    }

    /// Returns the cluster-state store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Returns the construction-time settings.
    #[must_use]
    pub const fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Allocates the next connection id. Ids start at 1.
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}
