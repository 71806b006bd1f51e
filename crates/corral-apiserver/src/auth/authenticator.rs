//! Credential authentication.
//!
//! [`Authenticator::authenticate`] resolves a [`Credential`] to an entity.
//! The scheme is chosen from the credential's shape:
//!
//! - **Password**: the tag is looked up in the cluster-state store and the
//!   secret compared against the stored salted hash in constant time.
//!   Machine agents must also present their provisioning nonce.
//! - **Macaroon**: the bundle is verified by the server's [`Bakery`]. An
//!   undischarged third-party caveat fails with
//!   [`ApiError::DischargeRequired`] carrying the caveat.
//! - **Anonymous**: a fresh login macaroon is minted and returned inside a
//!   [`ApiError::DischargeRequired`], so the client can start the macaroon
//!   flow.
//!
//! # Security Considerations
//!
//! - Unknown tags and wrong secrets fail identically with
//!   [`ApiError::InvalidCredentials`] unless the caller demands a lookup.
//! - The nonce is checked only after the secret, so an unauthenticated
//!   caller cannot probe which machines are provisioned.
//! - Authentication only reads from the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use corral_core::credentials::{Bakery, BakeryError, Credential, MacaroonError};
use corral_core::state::{EntityStore, StoreError};
use corral_core::{Tag, TagKind};
use secrecy::SecretString;
use tracing::{debug, error};

use crate::protocol::error::ApiError;

/// Source of the current time for caveat checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A successfully authenticated entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// The resolved entity.
    pub entity: Tag,
    /// When the presented credential stops being valid, if it expires.
    pub expiry: Option<DateTime<Utc>>,
}

/// Validates login credentials against the cluster-state store.
pub struct Authenticator {
    store: Arc<dyn EntityStore>,
    bakery: Arc<Bakery>,
    clock: Clock,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("bakery", &self.bakery)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Creates an authenticator using the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn EntityStore>, bakery: Arc<Bakery>) -> Self {
        Self {
            store,
            bakery,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replaces the clock used for `time-before` caveats.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the bakery.
    #[must_use]
    pub const fn bakery(&self) -> &Arc<Bakery> {
        &self.bakery
    }

    /// Authenticates `credential`.
    ///
    /// With `require_lookup`, the entity must have a record in the store and
    /// its absence is reported as [`ApiError::EntityNotFound`].
    ///
    /// # Errors
    ///
    /// [`ApiError::InvalidCredentials`], [`ApiError::EntityNotFound`],
    /// [`ApiError::DischargeRequired`], [`ApiError::NotProvisioned`], or
    /// [`ApiError::Internal`] if the store fails.
    pub async fn authenticate(
        &self,
        credential: &Credential,
        require_lookup: bool,
    ) -> Result<Authenticated, ApiError> {
        match credential {
            Credential::Password { tag, secret, nonce } => {
                self.authenticate_password(tag, secret, nonce.as_deref(), require_lookup)
                    .await
            },
            Credential::Macaroons(bundle) => {
                self.authenticate_macaroons(bundle, require_lookup).await
            },
            Credential::Anonymous => Err(self.mint_login_challenge()),
        }
    }

    async fn authenticate_password(
        &self,
        tag: &Tag,
        secret: &SecretString,
        nonce: Option<&str>,
        require_lookup: bool,
    ) -> Result<Authenticated, ApiError> {
        if tag.is_external_user() {
            debug!(entity = %tag, "password login rejected for external user");
            return Err(ApiError::InvalidCredentials);
        }
        let record = match self.store.lookup_entity(tag).await {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) if require_lookup => {
                return Err(ApiError::EntityNotFound {
                    tag: tag.to_string(),
                });
            },
            Err(StoreError::NotFound { .. }) => return Err(ApiError::InvalidCredentials),
            Err(e) => return Err(store_failure(&e)),
        };

        let matches = record
            .password_hash
            .as_ref()
            .is_some_and(|hash| hash.verify(secret));
        if !matches {
            return Err(ApiError::InvalidCredentials);
        }

        if tag.kind() == TagKind::Machine {
            let provisioned = match (record.nonce.as_deref(), nonce) {
                (Some(stored), Some(presented)) => stored == presented,
                _ => false,
            };
            if !provisioned {
                return Err(ApiError::NotProvisioned {
                    tag: tag.to_string(),
                });
            }
        }

        Ok(Authenticated {
            entity: record.tag,
            expiry: None,
        })
    }

    async fn authenticate_macaroons(
        &self,
        bundle: &[corral_core::credentials::Macaroon],
        require_lookup: bool,
    ) -> Result<Authenticated, ApiError> {
        let verified = match self.bakery.check(bundle, (self.clock)()) {
            Ok(verified) => verified,
            Err(BakeryError::Macaroon(MacaroonError::DischargeRequired { caveat })) => {
                return Err(ApiError::DischargeRequired {
                    caveat,
                    macaroon: None,
                });
            },
            Err(e) => {
                debug!(error = %e, "macaroon verification failed");
                return Err(ApiError::InvalidCredentials);
            },
        };

        let entity = verified.identity;
        if entity.kind() != TagKind::User {
            debug!(entity = %entity, "macaroon login declared a non-user identity");
            return Err(ApiError::InvalidCredentials);
        }

        // External users are vouched for by the identity service and need no
        // local record unless the login is scoped to a model.
        if require_lookup || !entity.is_external_user() {
            let exists = self
                .store
                .entity_exists(&entity)
                .await
                .map_err(|e| store_failure(&e))?;
            if !exists {
                return Err(if require_lookup {
                    ApiError::EntityNotFound {
                        tag: entity.to_string(),
                    }
                } else {
                    ApiError::InvalidCredentials
                });
            }
        }

        Ok(Authenticated {
            entity,
            expiry: verified.expiry,
        })
    }

    fn mint_login_challenge(&self) -> ApiError {
        let macaroon = match self.bakery.new_login_macaroon((self.clock)()) {
            Ok(m) => m,
            Err(e) => return ApiError::internal(format!("minting login macaroon: {e}")),
        };
        let caveat = macaroon.third_party_caveats().next().cloned();
        match caveat {
            Some(caveat) => ApiError::DischargeRequired {
                caveat,
                macaroon: Some(Box::new(macaroon)),
            },
            None => ApiError::internal("login macaroon has no third-party caveat"),
        }
    }
}

fn store_failure(err: &StoreError) -> ApiError {
    error!(error = %err, "cluster-state store failure during login");
    ApiError::internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use corral_core::credentials::{Discharger, Macaroon, SecretHash};
    use corral_core::state::{EntityRecord, InMemoryEntityStore};

    use super::*;

    const ROOT: [u8; 32] = [1u8; 32];
    const SHARED: [u8; 32] = [2u8; 32];

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn fixture() -> (Authenticator, Arc<InMemoryEntityStore>) {
        let store = Arc::new(InMemoryEntityStore::with_records([
            EntityRecord::new(Tag::user("admin").unwrap(), SecretHash::generate(&secret("pw"))),
            EntityRecord::new(Tag::machine("0").unwrap(), SecretHash::generate(&secret("agent")))
                .with_nonce("nonce-0"),
        ]));
        let bakery = Arc::new(Bakery::new(ROOT, "corral", "https://idm", SHARED));
        (Authenticator::new(store.clone(), bakery), store)
    }

    fn password(tag: &str, pw: &str) -> Credential {
        Credential::Password {
            tag: Tag::parse(tag).unwrap(),
            secret: secret(pw),
            nonce: None,
        }
    }

    #[tokio::test]
    async fn test_password_success_and_mismatch() {
        let (auth, _) = fixture();
        let ok = auth.authenticate(&password("user-admin", "pw"), false).await.unwrap();
        assert_eq!(ok.entity, Tag::user("admin").unwrap());
        assert_eq!(ok.expiry, None);

        assert_eq!(
            auth.authenticate(&password("user-admin", "wrong"), false).await,
            Err(ApiError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_unknown_tag_depends_on_lookup_requirement() {
        let (auth, _) = fixture();
        assert_eq!(
            auth.authenticate(&password("user-ghost", "pw"), false).await,
            Err(ApiError::InvalidCredentials)
        );
        assert_eq!(
            auth.authenticate(&password("user-ghost", "pw"), true).await,
            Err(ApiError::EntityNotFound {
                tag: "user-ghost".into()
            })
        );
    }

    #[tokio::test]
    async fn test_machine_nonce_checked_after_password() {
        let (auth, _) = fixture();
        let with_nonce = |pw: &str, nonce: Option<&str>| Credential::Password {
            tag: Tag::machine("0").unwrap(),
            secret: secret(pw),
            nonce: nonce.map(str::to_string),
        };
        assert!(auth.authenticate(&with_nonce("agent", Some("nonce-0")), false).await.is_ok());
        assert_eq!(
            auth.authenticate(&with_nonce("agent", Some("other")), false).await,
            Err(ApiError::NotProvisioned {
                tag: "machine-0".into()
            })
        );
        assert_eq!(
            auth.authenticate(&with_nonce("wrong", Some("other")), false).await,
            Err(ApiError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_external_user_cannot_use_password() {
        let (auth, _) = fixture();
        assert_eq!(
            auth.authenticate(&password("user-bob@external", "pw"), false).await,
            Err(ApiError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_internal() {
        let (auth, store) = fixture();
        store.set_available(false);
        assert!(matches!(
            auth.authenticate(&password("user-admin", "pw"), false).await,
            Err(ApiError::Internal { .. })
        ));
    }

    #[tokio::test]
    async fn test_anonymous_login_gets_macaroon_to_discharge() {
        let (auth, _) = fixture();
        let Err(ApiError::DischargeRequired { caveat, macaroon }) =
            auth.authenticate(&Credential::Anonymous, false).await
        else {
            panic!("expected discharge-required");
        };
        let macaroon = macaroon.unwrap();
        assert_eq!(macaroon.third_party_caveats().next(), Some(&caveat));

        let discharge = Discharger::new("https://idm", SHARED)
            .discharge(&caveat, |_| Ok(vec!["declared identity user-bob@external".into()]))
            .unwrap()
            .bind_for_request(&macaroon);
        let ok = auth
            .authenticate(&Credential::Macaroons(vec![*macaroon, discharge]), false)
            .await
            .unwrap();
        assert_eq!(ok.entity, Tag::parse("user-bob@external").unwrap());
        assert!(ok.expiry.is_some());
    }

    #[tokio::test]
    async fn test_macaroon_identity_rules() {
        let (auth, _) = fixture();
        let declared = |who: &str| {
            let mut m = Macaroon::new(&ROOT, "id", "corral").unwrap();
            m.add_first_party_caveat(format!("declared identity {who}")).unwrap();
            Credential::Macaroons(vec![m])
        };

        // Local users must exist.
        assert!(auth.authenticate(&declared("user-admin"), false).await.is_ok());
        assert_eq!(
            auth.authenticate(&declared("user-ghost"), false).await,
            Err(ApiError::InvalidCredentials)
        );
        // External users need a record only for model-scoped logins.
        assert!(auth.authenticate(&declared("user-bob@external"), false).await.is_ok());
        assert_eq!(
            auth.authenticate(&declared("user-bob@external"), true).await,
            Err(ApiError::EntityNotFound {
                tag: "user-bob@external".into()
            })
        );
        // Agents cannot log in with macaroons.
        assert_eq!(
            auth.authenticate(&declared("machine-0"), false).await,
            Err(ApiError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_expired_macaroon_rejected_via_clock() {
        let (auth, _) = fixture();
        let now = Utc::now();
        let auth = auth.with_clock(Arc::new(move || now + Duration::hours(2)));
        let mut m = Macaroon::new(&ROOT, "id", "corral").unwrap();
        m.add_first_party_caveat("declared identity user-admin").unwrap();
        m.add_first_party_caveat(format!("time-before {}", (now + Duration::hours(1)).to_rfc3339()))
            .unwrap();
        assert_eq!(
            auth.authenticate(&Credential::Macaroons(vec![m]), false).await,
            Err(ApiError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_forged_macaroon_rejected() {
        let (auth, _) = fixture();
        let mut m = Macaroon::new(&[9u8; 32], "id", "corral").unwrap();
        m.add_first_party_caveat("declared identity user-admin").unwrap();
        assert_eq!(
            auth.authenticate(&Credential::Macaroons(vec![m]), false).await,
            Err(ApiError::InvalidCredentials)
        );
    }
}
