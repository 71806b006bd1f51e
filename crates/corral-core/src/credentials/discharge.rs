//! Macaroon minting (server side) and discharging (third-party side).
//!
//! The API server's [`Bakery`] mints login macaroons that carry a
//! third-party caveat addressed to an identity service. The caveat id is the
//! caveat root key and condition, sealed under a key shared with that
//! service, so only the service can read it:
//!
//! ```text
//! caveat_id = base64url(seal(shared_key, json{ caveat_key, condition }))
//! ```
//!
//! The identity service runs a [`Discharger`], which opens the caveat id,
//! decides whether the condition holds, and mints a discharge macaroon rooted
//! at the caveat key. The discharge normally declares the authenticated
//! identity with a `declared identity <tag>` caveat.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::caveats::{CaveatChecker, Condition};
use super::macaroon::{Caveat, Macaroon, MacaroonError, verify_bundle};
use super::seal;
use crate::tag::Tag;

/// Condition placed on login macaroons for the identity service.
pub const AUTHENTICATED_USER_CONDITION: &str = "is-authenticated-user";

/// Default lifetime of freshly minted login macaroons, in seconds.
pub const DEFAULT_LOGIN_MACAROON_TTL_SECS: i64 = 24 * 60 * 60;

/// Errors from checking a macaroon bundle at login.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BakeryError {
    /// Verification of the bundle failed.
    #[error(transparent)]
    Macaroon(#[from] MacaroonError),

    /// The bundle verified but no caveat declared an identity.
    #[error("macaroon bundle declares no identity")]
    NoDeclaredIdentity,
}

/// Errors from discharging a third-party caveat.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DischargeError {
    /// The caveat id could not be opened with this discharger's key.
    #[error("caveat id is not addressed to this discharger")]
    NotAddressedToUs,

    /// The third party refused to discharge the condition.
    #[error("discharge refused: {0}")]
    Refused(String),

    /// Minting the discharge failed.
    #[error(transparent)]
    Macaroon(#[from] MacaroonError),
}

#[derive(Serialize, Deserialize)]
struct CaveatPayload {
    caveat_key: String,
    condition: String,
}

pub(crate) fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// The outcome of a successful bundle check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// The declared identity.
    pub identity: Tag,
    /// Earliest `time-before` across the bundle, if any.
    pub expiry: Option<DateTime<Utc>>,
}

/// Mints and verifies the server's own macaroons.
pub struct Bakery {
    root_key: SecretBox<[u8; 32]>,
    location: String,
    identity_location: String,
    identity_shared_key: SecretBox<[u8; 32]>,
    login_ttl: Duration,
}

impl std::fmt::Debug for Bakery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bakery")
            .field("location", &self.location)
            .field("identity_location", &self.identity_location)
            .finish_non_exhaustive()
    }
}

impl Bakery {
    /// Creates a bakery.
    #[must_use]
    pub fn new(
        root_key: [u8; 32],
        location: impl Into<String>,
        identity_location: impl Into<String>,
        identity_shared_key: [u8; 32],
    ) -> Self {
        Self {
            root_key: SecretBox::new(Box::new(root_key)),
            location: location.into(),
            identity_location: identity_location.into(),
            identity_shared_key: SecretBox::new(Box::new(identity_shared_key)),
            login_ttl: Duration::seconds(DEFAULT_LOGIN_MACAROON_TTL_SECS),
        }
    }

    /// Creates a bakery with a random root key.
    #[must_use]
    pub fn with_random_root_key(
        location: impl Into<String>,
        identity_location: impl Into<String>,
        identity_shared_key: [u8; 32],
    ) -> Self {
        Self::new(random_key(), location, identity_location, identity_shared_key)
    }

    /// Sets the lifetime of minted login macaroons.
    #[must_use]
    pub fn with_login_ttl(mut self, ttl: Duration) -> Self {
        self.login_ttl = ttl;
        self
    }

    /// Returns the bakery's location.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Mints a login macaroon that must be discharged by the identity
    /// service.
    ///
    /// # Errors
    ///
    /// Propagates [`MacaroonError`] from caveat construction.
    pub fn new_login_macaroon(&self, now: DateTime<Utc>) -> Result<Macaroon, MacaroonError> {
        let mut id = [0u8; 16];
        OsRng.fill_bytes(&mut id);
        let mut macaroon = Macaroon::new(
            self.root_key.expose_secret(),
            hex::encode(id),
            self.location.clone(),
        )?;
        macaroon.add_first_party_caveat(Condition::TimeBefore(now + self.login_ttl).to_string())?;

        let caveat_key = random_key();
        let caveat_id = encode_caveat_id(
            self.identity_shared_key.expose_secret(),
            &caveat_key,
            AUTHENTICATED_USER_CONDITION,
        )?;
        macaroon.add_third_party_caveat(&caveat_key, caveat_id, self.identity_location.clone())?;
        Ok(macaroon)
    }

    /// Verifies a login bundle and extracts the declared identity.
    ///
    /// # Errors
    ///
    /// - [`BakeryError::Macaroon`] wrapping
    ///   [`MacaroonError::DischargeRequired`] if a third-party caveat is not
    ///   discharged, or any other verification failure.
    /// - [`BakeryError::NoDeclaredIdentity`] if nothing declared an identity.
    pub fn check(
        &self,
        bundle: &[Macaroon],
        now: DateTime<Utc>,
    ) -> Result<VerifiedIdentity, BakeryError> {
        let mut checker = CaveatChecker::new(now);
        verify_bundle(bundle, self.root_key.expose_secret(), |c| checker.check(c))?;
        let (identity, expiry) = checker.finish();
        let identity = identity.ok_or(BakeryError::NoDeclaredIdentity)?;
        Ok(VerifiedIdentity { identity, expiry })
    }
}

fn encode_caveat_id(
    shared_key: &[u8; 32],
    caveat_key: &[u8; 32],
    condition: &str,
) -> Result<String, MacaroonError> {
    let payload = CaveatPayload {
        caveat_key: hex::encode(caveat_key),
        condition: condition.to_string(),
    };
    // Serializing two strings into JSON cannot fail.
    let json = serde_json::to_vec(&payload).unwrap_or_default();
    let sealed = seal::seal(shared_key, &json).ok_or(MacaroonError::SealFailed)?;
    Ok(URL_SAFE_NO_PAD.encode(sealed))
}

/// The third-party side of a caveat: opens caveat ids addressed to it and
/// mints discharges.
pub struct Discharger {
    location: String,
    shared_key: SecretBox<[u8; 32]>,
}

impl Discharger {
    /// Creates a discharger sharing `shared_key` with the bakery.
    #[must_use]
    pub fn new(location: impl Into<String>, shared_key: [u8; 32]) -> Self {
        Self {
            location: location.into(),
            shared_key: SecretBox::new(Box::new(shared_key)),
        }
    }

    /// Discharges `caveat`.
    ///
    /// `decide` receives the caveat's condition and returns the first-party
    /// conditions to place on the discharge (typically a declared identity),
    /// or a refusal reason.
    ///
    /// # Errors
    ///
    /// Returns [`DischargeError`] if the caveat is not addressed to this
    /// discharger or `decide` refuses.
    pub fn discharge<F>(&self, caveat: &Caveat, decide: F) -> Result<Macaroon, DischargeError>
    where
        F: FnOnce(&str) -> Result<Vec<String>, String>,
    {
        let sealed = URL_SAFE_NO_PAD
            .decode(caveat.id.as_bytes())
            .map_err(|_| DischargeError::NotAddressedToUs)?;
        let json = seal::open(self.shared_key.expose_secret(), &sealed)
            .ok_or(DischargeError::NotAddressedToUs)?;
        let payload: CaveatPayload =
            serde_json::from_slice(&json).map_err(|_| DischargeError::NotAddressedToUs)?;
        let caveat_key: [u8; 32] = hex::decode(&payload.caveat_key)
            .ok()
            .and_then(|k| k.try_into().ok())
            .ok_or(DischargeError::NotAddressedToUs)?;

        let conditions = decide(&payload.condition).map_err(DischargeError::Refused)?;
        let mut discharge = Macaroon::new(&caveat_key, caveat.id.clone(), self.location.clone())?;
        for condition in conditions {
            discharge.add_first_party_caveat(condition)?;
        }
        Ok(discharge)
    }
}
