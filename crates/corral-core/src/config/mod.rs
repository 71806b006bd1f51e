//! API server configuration.
//!
//! Loaded from TOML at startup and fixed for the life of the process. Every
//! value is supplied at server construction; nothing here is renegotiated per
//! connection.
//!
//! ```toml
//! listen_address = "0.0.0.0:17070"
//! controller_tag = "controller-prod"
//! login_rate_limit = 10
//! client_ping_interval_secs = 180
//! store_ping_interval_secs = 10
//! api_addresses = ["10.0.0.1:17070"]
//!
//! [macaroon]
//! location = "corral"
//! identity_location = "https://idm.example.com"
//! identity_shared_key_hex = "…64 hex chars…"
//!
//! [[entities]]
//! tag = "user-admin"
//! password_hash = "<salt-hex>:<digest-hex>"
//! ```

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::Bakery;
use crate::credentials::discharge::random_key;
use crate::state::EntityRecord;
use crate::tag::{Tag, TagKind};

/// Top-level API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the RPC listener binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// Tag of the controller this server fronts.
    #[serde(default = "default_controller_tag")]
    pub controller_tag: Tag,

    /// Maximum number of logins in flight at once.
    #[serde(default = "default_login_rate_limit")]
    pub login_rate_limit: usize,

    /// Clients idle for longer than this are disconnected.
    #[serde(default = "default_client_ping_interval_secs")]
    pub client_ping_interval_secs: u64,

    /// How often each connection pings the cluster-state store.
    #[serde(default = "default_store_ping_interval_secs")]
    pub store_ping_interval_secs: u64,

    /// Maximum concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Server identity string returned to v3 clients at login.
    #[serde(default = "default_server_info")]
    pub server_info: String,

    /// API addresses advertised to clients at login.
    #[serde(default)]
    pub api_addresses: Vec<String>,

    /// Macaroon bakery settings.
    #[serde(default)]
    pub macaroon: MacaroonConfig,

    /// Entities seeded into the in-memory cluster-state store.
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            controller_tag: default_controller_tag(),
            login_rate_limit: default_login_rate_limit(),
            client_ping_interval_secs: default_client_ping_interval_secs(),
            store_ping_interval_secs: default_store_ping_interval_secs(),
            max_connections: default_max_connections(),
            server_info: default_server_info(),
            api_addresses: Vec::new(),
            macaroon: MacaroonConfig::default(),
            entities: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or [`Self::validate`] fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks cross-field constraints. Fails closed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.login_rate_limit == 0 {
            return Err(ConfigError::Validation(
                "login_rate_limit must be at least 1".to_string(),
            ));
        }
        if self.client_ping_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "client_ping_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.store_ping_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "store_ping_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.controller_tag.kind() != TagKind::Controller {
            return Err(ConfigError::Validation(format!(
                "controller_tag {} is not a controller tag",
                self.controller_tag
            )));
        }
        self.macaroon.root_key()?;
        self.macaroon.identity_shared_key()?;

        let mut seen = BTreeSet::new();
        for entity in &self.entities {
            if !seen.insert(&entity.tag) {
                return Err(ConfigError::Validation(format!(
                    "duplicate entity {}",
                    entity.tag
                )));
            }
            if entity.tag.is_external_user() {
                return Err(ConfigError::Validation(format!(
                    "external user {} cannot have a local record",
                    entity.tag
                )));
            }
        }
        Ok(())
    }

    /// Returns the client ping interval.
    #[must_use]
    pub const fn client_ping_interval(&self) -> Duration {
        Duration::from_secs(self.client_ping_interval_secs)
    }

    /// Returns the store ping interval.
    #[must_use]
    pub const fn store_ping_interval(&self) -> Duration {
        Duration::from_secs(self.store_ping_interval_secs)
    }
}

/// Macaroon bakery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MacaroonConfig {
    /// Location stamped on minted macaroons.
    #[serde(default = "default_macaroon_location")]
    pub location: String,

    /// Hex-encoded 32-byte root key. A random key is generated when absent,
    /// which invalidates outstanding macaroons on restart.
    #[serde(default)]
    pub root_key_hex: Option<String>,

    /// Location of the identity service that discharges login macaroons.
    #[serde(default = "default_identity_location")]
    pub identity_location: String,

    /// Hex-encoded 32-byte key shared with the identity service. When absent
    /// a random key is used and no third party can discharge login caveats.
    #[serde(default)]
    pub identity_shared_key_hex: Option<String>,
}

impl Default for MacaroonConfig {
    fn default() -> Self {
        Self {
            location: default_macaroon_location(),
            root_key_hex: None,
            identity_location: default_identity_location(),
            identity_shared_key_hex: None,
        }
    }
}

impl MacaroonConfig {
    /// Decodes the root key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the key is not 32 hex bytes.
    pub fn root_key(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        decode_key("macaroon.root_key_hex", self.root_key_hex.as_deref())
    }

    /// Decodes the identity shared key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the key is not 32 hex bytes.
    pub fn identity_shared_key(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        decode_key(
            "macaroon.identity_shared_key_hex",
            self.identity_shared_key_hex.as_deref(),
        )
    }
    /// Builds the bakery described by this section.
    ///
    /// Missing keys are replaced by random ones.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a configured key is malformed.
    pub fn bakery(&self) -> Result<Bakery, ConfigError> {
        let root_key = self.root_key()?.unwrap_or_else(random_key);
        let shared_key = self.identity_shared_key()?.unwrap_or_else(random_key);
        Ok(Bakery::new(
            root_key,
            self.location.clone(),
            self.identity_location.clone(),
            shared_key,
        ))
    }
}

fn decode_key(field: &str, raw: Option<&str>) -> Result<Option<[u8; 32]>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let bytes = hex::decode(raw)
        .map_err(|e| ConfigError::Validation(format!("{field} is not valid hex: {e}")))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ConfigError::Validation(format!("{field} must decode to 32 bytes")))?;
    Ok(Some(key))
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 17070))
}

fn default_controller_tag() -> Tag {
    Tag::parse("controller-corral").unwrap_or_else(|_| unreachable!("static tag is valid"))
}

const fn default_login_rate_limit() -> usize {
    10
}

const fn default_client_ping_interval_secs() -> u64 {
    180
}

const fn default_store_ping_interval_secs() -> u64 {
    10
}

const fn default_max_connections() -> usize {
    1000
}

fn default_server_info() -> String {
    format!("corral-apiserver/{}", env!("CARGO_PKG_VERSION"))
}

fn default_macaroon_location() -> String {
    "corral".to_string()
}

fn default_identity_location() -> String {
    "https://identity.invalid".to_string()
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
