//! Login credentials and the primitives that back them.
//!
//! # Module Overview
//!
//! - [`password`]: salted SHA-256 secret hashes ([`SecretHash`])
//! - [`macaroon`]: HMAC-chained bearer macaroons ([`Macaroon`],
//!   [`verify_bundle`])
//! - [`caveats`]: the first-party caveat language ([`Condition`],
//!   [`CaveatChecker`])
//! - [`discharge`]: server-side minting ([`Bakery`]) and third-party
//!   discharging ([`Discharger`])

pub mod caveats;
pub mod discharge;
pub mod macaroon;
pub mod password;
pub(crate) mod seal;

use std::fmt;

use secrecy::SecretString;

pub use caveats::{CaveatChecker, Condition};
pub use discharge::{Bakery, BakeryError, Discharger, DischargeError, VerifiedIdentity};
pub use macaroon::{Caveat, Macaroon, MacaroonError, verify_bundle};
pub use password::{SecretHash, SecretHashError};

use crate::tag::Tag;

/// An authentication assertion presented at login.
///
/// Transient: built from the login request and dropped when the login call
/// returns.
pub enum Credential {
    /// A tag and secret, plus the provisioning nonce for machine agents.
    Password {
        /// Claimed entity.
        tag: Tag,
        /// Presented secret.
        secret: SecretString,
        /// Provisioning nonce, if presented.
        nonce: Option<String>,
    },
    /// A primary macaroon followed by bound discharges.
    Macaroons(Vec<Macaroon>),
    /// Neither a password nor macaroons. Versions that support macaroon
    /// login answer this with a freshly minted macaroon to discharge.
    Anonymous,
}

impl Credential {
    /// Short name of the scheme, for logging.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Macaroons(_) => "macaroon",
            Self::Anonymous => "anonymous",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { tag, nonce, .. } => f
                .debug_struct("Password")
                .field("tag", tag)
                .field("nonce", &nonce.is_some())
                .finish_non_exhaustive(),
            Self::Macaroons(bundle) => f.debug_tuple("Macaroons").field(&bundle.len()).finish(),
            Self::Anonymous => f.write_str("Anonymous"),
        }
    }
}
