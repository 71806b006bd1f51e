//! The versioned Admin facade.
//!
//! `Admin.Login` is the only call an unauthenticated session may make. The
//! version in the first Admin request selects a login handler from the
//! [`AdminFacadeRegistry`]; the handler decides which credential schemes the
//! version understands and what shape its login result takes.
//!
//! | Version | Credentials                  | Result                |
//! |---------|------------------------------|-----------------------|
//! | 0       | password                     | [`LoginResultV0`]     |
//! | 3       | password, macaroon, anonymous | [`LoginResultV3`]    |
//!
//! # Invariants
//!
//! - [INV-AD-001] The registry is built at startup and never changes.
//! - [INV-AD-002] An unregistered version fails with
//!   [`ApiError::UnsupportedVersion`]; there is no fallback version.
//! - [INV-AD-003] At most one handler is selected per session.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use corral_core::credentials::{Credential, Macaroon};
use corral_core::{ControllerMode, Tag, TagKind};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ApiError;
use super::root::{FacadeVersions, RegistrationError};

/// Name of the login facade.
pub const ADMIN_FACADE: &str = "Admin";

/// Name of the login method.
pub const LOGIN_METHOD: &str = "Login";

/// Parameters of `Admin.Login`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    /// Entity claiming to log in, for password logins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_tag: Option<String>,

    /// Password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,

    /// Provisioning nonce presented by machine agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Primary macaroon followed by bound discharges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub macaroons: Vec<Macaroon>,

    /// Model the session is scoped to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tag: Option<String>,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("auth_tag", &self.auth_tag)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("nonce", &self.nonce.is_some())
            .field("macaroons", &self.macaroons.len())
            .field("model_tag", &self.model_tag)
            .finish()
    }
}

impl LoginRequest {
    /// Creates a password login.
    #[must_use]
    pub fn password(tag: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            auth_tag: Some(tag.into()),
            credentials: Some(secret.into()),
            ..Self::default()
        }
    }

    /// Creates a macaroon login.
    #[must_use]
    pub fn macaroons(bundle: Vec<Macaroon>) -> Self {
        Self {
            macaroons: bundle,
            ..Self::default()
        }
    }

    /// Sets the provisioning nonce.
    #[must_use]
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Scopes the login to a model.
    #[must_use]
    pub fn with_model_tag(mut self, model_tag: impl Into<String>) -> Self {
        self.model_tag = Some(model_tag.into());
        self
    }

    /// Converts the request into a credential and the optional model scope.
    ///
    /// Macaroons take precedence over a password; a request with neither is
    /// anonymous.
    ///
    /// # Errors
    ///
    /// - [`ApiError::BadRequest`] if `model_tag` is not a model tag.
    /// - [`ApiError::InvalidCredentials`] if `auth_tag` is malformed or a
    ///   password arrives without a tag.
    pub fn into_credential(self) -> Result<(Credential, Option<Tag>), ApiError> {
        let model = match self.model_tag.as_deref() {
            Some(raw) => match Tag::parse(raw) {
                Ok(tag) if tag.kind() == TagKind::Model => Some(tag),
                _ => return Err(ApiError::bad_request(format!("{raw:?} is not a model tag"))),
            },
            None => None,
        };

        let credential = if !self.macaroons.is_empty() {
            Credential::Macaroons(self.macaroons)
        } else if let Some(raw) = self.auth_tag {
            let tag = Tag::parse(&raw).map_err(|_| ApiError::InvalidCredentials)?;
            Credential::Password {
                tag,
                secret: SecretString::from(self.credentials.unwrap_or_default()),
                nonce: self.nonce,
            }
        } else if self.credentials.is_some() {
            return Err(ApiError::InvalidCredentials);
        } else {
            Credential::Anonymous
        };
        Ok((credential, model))
    }
}

/// Everything a login handler may report about a successful login.
#[derive(Debug, Clone)]
pub struct LoginSummary {
    /// The authenticated entity.
    pub entity: Tag,
    /// This controller.
    pub controller_tag: Tag,
    /// The model the session is scoped to.
    pub model_tag: Option<Tag>,
    /// Server identification string.
    pub server_info: String,
    /// Advertised API addresses.
    pub servers: Vec<String>,
    /// Facades reachable under the session's restrictions.
    pub facades: Vec<FacadeVersions>,
    /// When the presented credential expires.
    pub credentials_expiry: Option<DateTime<Utc>>,
    /// Controller mode read at login.
    pub mode: ControllerMode,
}

/// Login result understood by legacy clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResultV0 {
    /// The authenticated entity.
    pub entity_tag: String,
    /// Advertised API addresses.
    pub servers: Vec<String>,
}

/// Login result of version 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResultV3 {
    /// The authenticated entity.
    pub entity_tag: String,
    /// This controller.
    pub controller_tag: String,
    /// The model the session is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tag: Option<String>,
    /// Server identification string.
    pub server_info: String,
    /// Advertised API addresses.
    pub servers: Vec<String>,
    /// Reachable facades and versions.
    pub facades: Vec<FacadeVersions>,
    /// When the presented credential expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_expiry: Option<DateTime<Utc>>,
    /// Controller mode the session was admitted under.
    pub controller_mode: ControllerMode,
}

/// One version of the login handshake.
pub trait AdminHandler: Send + Sync {
    /// The Admin version this handler implements.
    fn version(&self) -> u32;

    /// Whether macaroon and anonymous logins are understood.
    fn supports_macaroons(&self) -> bool;

    /// Checks that the credential scheme is available at this version.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidCredentials`] for schemes the version does
    /// not know.
    fn accept(&self, credential: &Credential) -> Result<(), ApiError> {
        match credential {
            Credential::Password { .. } => Ok(()),
            Credential::Macaroons(_) | Credential::Anonymous if self.supports_macaroons() => Ok(()),
            Credential::Macaroons(_) | Credential::Anonymous => Err(ApiError::InvalidCredentials),
        }
    }

    /// Rewrites an authentication failure into something the version's
    /// clients understand.
    fn present_error(&self, err: ApiError) -> ApiError {
        err
    }

    /// Renders the login result.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Internal`] if the result cannot be encoded.
    fn login_result(&self, summary: &LoginSummary) -> Result<Value, ApiError>;
}

fn encode<T: Serialize>(result: &T) -> Result<Value, ApiError> {
    serde_json::to_value(result).map_err(|e| ApiError::internal(format!("encoding login result: {e}")))
}

/// Legacy login: passwords only, minimal result.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdminV0;

impl AdminHandler for AdminV0 {
    fn version(&self) -> u32 {
        0
    }

    fn supports_macaroons(&self) -> bool {
        false
    }

    fn present_error(&self, err: ApiError) -> ApiError {
        match err {
            ApiError::DischargeRequired { .. } => ApiError::InvalidCredentials,
            other => other,
        }
    }

    fn login_result(&self, summary: &LoginSummary) -> Result<Value, ApiError> {
        encode(&LoginResultV0 {
            entity_tag: summary.entity.to_string(),
            servers: summary.servers.clone(),
        })
    }
}

/// Current login: every credential scheme, full result.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdminV3;

impl AdminHandler for AdminV3 {
    fn version(&self) -> u32 {
        3
    }

    fn supports_macaroons(&self) -> bool {
        true
    }

    fn login_result(&self, summary: &LoginSummary) -> Result<Value, ApiError> {
        encode(&LoginResultV3 {
            entity_tag: summary.entity.to_string(),
            controller_tag: summary.controller_tag.to_string(),
            model_tag: summary.model_tag.as_ref().map(ToString::to_string),
            server_info: summary.server_info.clone(),
            servers: summary.servers.clone(),
            facades: summary.facades.clone(),
            credentials_expiry: summary.credentials_expiry,
            controller_mode: summary.mode,
        })
    }
}

type AdminFactory = Arc<dyn Fn() -> Box<dyn AdminHandler> + Send + Sync>;

/// Version table of login handlers.
#[derive(Clone, Default)]
pub struct AdminFacadeRegistry {
    versions: BTreeMap<u32, AdminFactory>,
}

impl fmt::Debug for AdminFacadeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminFacadeRegistry")
            .field("versions", &self.versions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdminFacadeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the registry with every built-in version (0 and 3).
    #[must_use]
    pub fn standard() -> Self {
        let mut versions: BTreeMap<u32, AdminFactory> = BTreeMap::new();
        versions.insert(0, Arc::new(|| Box::new(AdminV0)));
        versions.insert(3, Arc::new(|| Box::new(AdminV3)));
        Self { versions }
    }

    /// Adds a version.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Duplicate`] if `version` is taken.
    pub fn with_version<F>(mut self, version: u32, factory: F) -> Result<Self, RegistrationError>
    where
        F: Fn() -> Box<dyn AdminHandler> + Send + Sync + 'static,
    {
        if self.versions.contains_key(&version) {
            return Err(RegistrationError::Duplicate {
                name: ADMIN_FACADE,
                version,
            });
        }
        self.versions.insert(version, Arc::new(factory));
        Ok(self)
    }

    /// Returns the registered versions, ascending.
    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.versions.keys().copied().collect()
    }

    /// Constructs the handler for `version`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::UnsupportedVersion`] if `version` is not
    /// registered.
    pub fn select(&self, version: u32) -> Result<Box<dyn AdminHandler>, ApiError> {
        self.versions
            .get(&version)
            .map(|factory| factory())
            .ok_or_else(|| ApiError::UnsupportedVersion {
                facade: ADMIN_FACADE.to_string(),
                version,
            })
    }
}

#[cfg(test)]
mod tests {
    use corral_core::credentials::Caveat;
    use serde_json::json;

    use super::*;

    fn summary() -> LoginSummary {
        LoginSummary {
            entity: Tag::user("admin").unwrap(),
            controller_tag: Tag::parse("controller-corral").unwrap(),
            model_tag: None,
            server_info: "corral-apiserver/test".into(),
            servers: vec!["10.0.0.1:17070".into()],
            facades: vec![FacadeVersions {
                name: "Pinger".into(),
                versions: vec![1],
            }],
            credentials_expiry: None,
            mode: ControllerMode::Normal,
        }
    }

    #[test]
    fn test_unregistered_version_is_rejected() {
        let registry = AdminFacadeRegistry::standard();
        assert_eq!(registry.versions(), vec![0, 3]);
        assert_eq!(registry.select(3).unwrap().version(), 3);
        assert_eq!(
            registry.select(2).err(),
            Some(ApiError::UnsupportedVersion {
                facade: "Admin".into(),
                version: 2
            })
        );
        assert!(AdminFacadeRegistry::new().select(0).is_err());
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let err = AdminFacadeRegistry::standard()
            .with_version(3, || Box::new(AdminV3))
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::Duplicate {
                name: "Admin",
                version: 3
            }
        );
        let extended = AdminFacadeRegistry::standard()
            .with_version(4, || Box::new(AdminV3))
            .unwrap();
        assert_eq!(extended.versions(), vec![0, 3, 4]);
    }

    #[test]
    fn test_result_shapes_per_version() {
        let v0 = AdminV0.login_result(&summary()).unwrap();
        assert_eq!(
            v0,
            json!({"entity_tag": "user-admin", "servers": ["10.0.0.1:17070"]})
        );

        let v3: LoginResultV3 =
            serde_json::from_value(AdminV3.login_result(&summary()).unwrap()).unwrap();
        assert_eq!(v3.entity_tag, "user-admin");
        assert_eq!(v3.controller_tag, "controller-corral");
        assert_eq!(v3.controller_mode, ControllerMode::Normal);
        assert_eq!(v3.facades.len(), 1);
    }

    #[test]
    fn test_legacy_version_refuses_macaroons() {
        assert_eq!(
            AdminV0.accept(&Credential::Anonymous),
            Err(ApiError::InvalidCredentials)
        );
        assert!(AdminV3.accept(&Credential::Anonymous).is_ok());

        let discharge = ApiError::DischargeRequired {
            caveat: Caveat {
                id: "cid".into(),
                verification_id: Some("00".into()),
                location: Some("https://idm".into()),
            },
            macaroon: None,
        };
        assert_eq!(
            AdminV0.present_error(discharge.clone()),
            ApiError::InvalidCredentials
        );
        assert_eq!(AdminV3.present_error(discharge.clone()), discharge);
    }

    #[test]
    fn test_request_to_credential() {
        let (cred, model) = LoginRequest::password("user-admin", "pw")
            .into_credential()
            .unwrap();
        assert!(matches!(cred, Credential::Password { .. }));
        assert!(model.is_none());

        let (cred, _) = LoginRequest::default().into_credential().unwrap();
        assert!(matches!(cred, Credential::Anonymous));

        let (_, model) = LoginRequest::password("user-admin", "pw")
            .with_model_tag("model-default")
            .into_credential()
            .unwrap();
        assert_eq!(model.unwrap().kind(), TagKind::Model);

        assert!(matches!(
            LoginRequest::password("user-admin", "pw")
                .with_model_tag("user-admin")
                .into_credential(),
            Err(ApiError::BadRequest { .. })
        ));
        assert_eq!(
            LoginRequest::password("not a tag", "pw").into_credential().err(),
            Some(ApiError::InvalidCredentials)
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", LoginRequest::password("user-admin", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
