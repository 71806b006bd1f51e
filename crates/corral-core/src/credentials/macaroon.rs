//! Macaroon bearer credentials.
//!
//! A macaroon is an identifier plus an ordered list of caveats, protected by
//! a chained HMAC signature:
//!
//! ```text
//! sig0 = HMAC(derive(root_key), identifier)
//! sig' = HMAC(sig, condition)                         first-party caveat
//! sig' = HMAC2(sig, verification_id, caveat_id)       third-party caveat
//! ```
//!
//! A third-party caveat embeds a fresh caveat root key, sealed under the
//! signature at the point the caveat was added (`verification_id`). The
//! third party issues a *discharge* macaroon rooted at that caveat key; the
//! client binds each discharge to the primary macaroon before presenting the
//! bundle, so discharges cannot be replayed against a different primary.
//!
//! # Invariants
//!
//! - [INV-MAC-001] Signatures are checked before any caveat is evaluated, so
//!   a forged macaroon never yields a discharge-required answer.
//! - [INV-MAC-002] Every discharge in a bundle must be consumed exactly once.
//! - [INV-MAC-003] Unknown first-party conditions fail closed.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::seal;

/// Maximum caveats accepted on a single macaroon.
pub const MAX_CAVEATS: usize = 32;

/// Maximum macaroons accepted in one bundle (primary + discharges).
pub const MAX_BUNDLE_LEN: usize = 8;

/// Maximum identifier or condition length in bytes.
pub const MAX_FIELD_LEN: usize = 4096;

const KEY_GENERATOR: &[u8] = b"macaroons-key-generator";

/// Errors produced when building or verifying macaroons.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MacaroonError {
    /// The macaroon already carries [`MAX_CAVEATS`] caveats.
    #[error("too many caveats: maximum is {max}")]
    TooManyCaveats {
        /// Maximum allowed caveats.
        max: usize,
    },

    /// The bundle holds more than [`MAX_BUNDLE_LEN`] macaroons, or none.
    #[error("invalid bundle size {len} (maximum {max})")]
    InvalidBundleSize {
        /// Number of macaroons presented.
        len: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// An identifier or condition exceeds [`MAX_FIELD_LEN`].
    #[error("macaroon field too long: {len} bytes")]
    FieldTooLong {
        /// Length of the rejected field.
        len: usize,
    },

    /// A signature did not verify.
    #[error("signature mismatch on macaroon {identifier:?}")]
    InvalidSignature {
        /// Identifier of the failing macaroon.
        identifier: String,
    },

    /// A third-party caveat has no matching discharge in the bundle.
    #[error("discharge required for third-party caveat at {location:?}", location = .caveat.location)]
    DischargeRequired {
        /// The undischarged caveat.
        caveat: Caveat,
    },

    /// A first-party caveat condition was not satisfied.
    #[error("caveat {condition:?} not satisfied: {reason}")]
    CaveatNotSatisfied {
        /// The failing condition.
        condition: String,
        /// Why the condition failed.
        reason: String,
    },

    /// A discharge in the bundle matched no caveat.
    #[error("discharge macaroon {identifier:?} was not used")]
    UnusedDischarge {
        /// Identifier of the unused discharge.
        identifier: String,
    },

    /// A caveat key or caveat id could not be sealed.
    #[error("failed to seal caveat payload")]
    SealFailed,

    /// A third-party caveat's verification id could not be opened.
    #[error("malformed verification id on caveat {caveat_id:?}")]
    MalformedVerificationId {
        /// The caveat whose verification id is bad.
        caveat_id: String,
    },
}

/// A single caveat.
///
/// First-party caveats carry only a condition in `id`. Third-party caveats
/// also carry the sealed caveat key in `verification_id` and the third
/// party's `location`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Caveat {
    /// Condition (first-party) or opaque caveat id (third-party).
    pub id: String,

    /// Sealed caveat root key, hex encoded. Present only on third-party
    /// caveats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_id: Option<String>,

    /// Where a discharge can be obtained. Present only on third-party caveats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Caveat {
    /// Returns `true` for third-party caveats.
    #[must_use]
    pub const fn is_third_party(&self) -> bool {
        self.verification_id.is_some()
    }
}

/// A macaroon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Macaroon {
    location: String,
    identifier: String,
    #[serde(default)]
    caveats: Vec<Caveat>,
    #[serde(with = "signature_hex")]
    signature: [u8; 32],
}

impl Macaroon {
    /// Mints a macaroon rooted at `root_key`.
    ///
    /// # Errors
    ///
    /// Returns [`MacaroonError::FieldTooLong`] for oversized identifiers.
    pub fn new(
        root_key: &[u8],
        identifier: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<Self, MacaroonError> {
        let identifier = identifier.into();
        check_field(&identifier)?;
        let signature = seal::keyed_hash(&derive_key(root_key), identifier.as_bytes());
        Ok(Self {
            location: location.into(),
            identifier,
            caveats: Vec::new(),
            signature,
        })
    }

    /// Appends a first-party caveat.
    ///
    /// # Errors
    ///
    /// Returns an error if the caveat limit is reached or the condition is
    /// oversized.
    pub fn add_first_party_caveat(
        &mut self,
        condition: impl Into<String>,
    ) -> Result<(), MacaroonError> {
        let condition = condition.into();
        self.check_capacity(&condition)?;
        self.signature = seal::keyed_hash(&self.signature, condition.as_bytes());
        self.caveats.push(Caveat {
            id: condition,
            verification_id: None,
            location: None,
        });
        Ok(())
    }

    /// Appends a third-party caveat whose discharge must be rooted at
    /// `caveat_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the caveat limit is reached or the caveat id is
    /// oversized.
    pub fn add_third_party_caveat(
        &mut self,
        caveat_key: &[u8; 32],
        caveat_id: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<(), MacaroonError> {
        let caveat_id = caveat_id.into();
        self.check_capacity(&caveat_id)?;
        let vid = seal::seal(&self.signature, caveat_key).ok_or(MacaroonError::SealFailed)?;
        self.signature = seal::keyed_hash2(&self.signature, &vid, caveat_id.as_bytes());
        self.caveats.push(Caveat {
            id: caveat_id,
            verification_id: Some(hex::encode(vid)),
            location: Some(location.into()),
        });
        Ok(())
    }

    /// Returns a copy of this discharge bound to `primary`.
    ///
    /// Clients must bind every discharge before presenting a bundle.
    #[must_use]
    pub fn bind_for_request(&self, primary: &Self) -> Self {
        let mut bound = self.clone();
        bound.signature = bind(&primary.signature, &self.signature);
        bound
    }

    /// Returns the macaroon's identifier.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the macaroon's location hint.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Returns all caveats in order.
    #[must_use]
    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    /// Returns the third-party caveats in order.
    pub fn third_party_caveats(&self) -> impl Iterator<Item = &Caveat> {
        self.caveats.iter().filter(|c| c.is_third_party())
    }

    /// Returns the current signature.
    #[must_use]
    pub const fn signature(&self) -> &[u8; 32] {
        &self.signature
    }

    fn check_capacity(&self, field: &str) -> Result<(), MacaroonError> {
        if self.caveats.len() >= MAX_CAVEATS {
            return Err(MacaroonError::TooManyCaveats { max: MAX_CAVEATS });
        }
        check_field(field)
    }

    /// Recomputes the signature chain under `key`, returning the chained
    /// signature and, for every caveat, the signature in effect just before
    /// it was added.
    fn chain(&self, key: &[u8; 32]) -> Result<([u8; 32], Vec<[u8; 32]>), MacaroonError> {
        let mut sig = seal::keyed_hash(key, self.identifier.as_bytes());
        let mut before = Vec::with_capacity(self.caveats.len());
        for caveat in &self.caveats {
            before.push(sig);
            sig = match &caveat.verification_id {
                None => seal::keyed_hash(&sig, caveat.id.as_bytes()),
                Some(vid_hex) => {
                    let vid = hex::decode(vid_hex).map_err(|_| {
                        MacaroonError::MalformedVerificationId {
                            caveat_id: caveat.id.clone(),
                        }
                    })?;
                    seal::keyed_hash2(&sig, &vid, caveat.id.as_bytes())
                },
            };
        }
        Ok((sig, before))
    }
}

fn check_field(field: &str) -> Result<(), MacaroonError> {
    if field.len() > MAX_FIELD_LEN {
        return Err(MacaroonError::FieldTooLong { len: field.len() });
    }
    Ok(())
}

fn derive_key(root_key: &[u8]) -> [u8; 32] {
    seal::keyed_hash(KEY_GENERATOR, root_key)
}

fn bind(primary_sig: &[u8; 32], discharge_sig: &[u8; 32]) -> [u8; 32] {
    seal::keyed_hash2(&[0u8; 32], primary_sig, discharge_sig)
}

/// Verifies a macaroon bundle.
///
/// `bundle[0]` is the primary macaroon, rooted at `root_key`; the rest are
/// bound discharges. `check` is called for every first-party condition in the
/// primary and in every discharge, in bundle traversal order.
///
/// # Errors
///
/// - [`MacaroonError::InvalidSignature`] if any signature chain fails.
/// - [`MacaroonError::DischargeRequired`] for the first third-party caveat
///   with no discharge in the bundle.
/// - [`MacaroonError::CaveatNotSatisfied`] if `check` rejects a condition.
/// - [`MacaroonError::UnusedDischarge`] if a discharge matched nothing.
pub fn verify_bundle<F>(bundle: &[Macaroon], root_key: &[u8], mut check: F) -> Result<(), MacaroonError>
where
    F: FnMut(&str) -> Result<(), String>,
{
    if bundle.is_empty() || bundle.len() > MAX_BUNDLE_LEN {
        return Err(MacaroonError::InvalidBundleSize {
            len: bundle.len(),
            max: MAX_BUNDLE_LEN,
        });
    }
    let (primary, discharges) = bundle.split_at(1);
    let primary = &primary[0];
    let mut used = vec![false; discharges.len()];

    verify_one(
        primary,
        &derive_key(root_key),
        None,
        discharges,
        &mut used,
        &mut check,
    )?;

    if let Some(idx) = used.iter().position(|u| !u) {
        return Err(MacaroonError::UnusedDischarge {
            identifier: discharges[idx].identifier.clone(),
        });
    }
    Ok(())
}

fn verify_one<F>(
    macaroon: &Macaroon,
    key: &[u8; 32],
    primary_sig: Option<&[u8; 32]>,
    discharges: &[Macaroon],
    used: &mut [bool],
    check: &mut F,
) -> Result<(), MacaroonError>
where
    F: FnMut(&str) -> Result<(), String>,
{
    let (chained, before) = macaroon.chain(key)?;
    let (expected, bind_to) = match primary_sig {
        Some(primary) => (bind(primary, &chained), *primary),
        None => (chained, macaroon.signature),
    };
    if !bool::from(expected.ct_eq(&macaroon.signature)) {
        return Err(MacaroonError::InvalidSignature {
            identifier: macaroon.identifier.clone(),
        });
    }

    for (caveat, sig_before) in macaroon.caveats.iter().zip(before.iter()) {
        let Some(vid_hex) = &caveat.verification_id else {
            check(&caveat.id).map_err(|reason| MacaroonError::CaveatNotSatisfied {
                condition: caveat.id.clone(),
                reason,
            })?;
            continue;
        };

        let malformed = || MacaroonError::MalformedVerificationId {
            caveat_id: caveat.id.clone(),
        };
        let vid = hex::decode(vid_hex).map_err(|_| malformed())?;
        let caveat_key: [u8; 32] = seal::open(sig_before, &vid)
            .and_then(|raw| raw.try_into().ok())
            .ok_or_else(malformed)?;

        let Some(idx) = discharges
            .iter()
            .enumerate()
            .position(|(i, d)| !used[i] && d.identifier == caveat.id)
        else {
            return Err(MacaroonError::DischargeRequired {
                caveat: caveat.clone(),
            });
        };
        used[idx] = true;
        verify_one(
            &discharges[idx],
            &derive_key(&caveat_key),
            Some(&bind_to),
            discharges,
            used,
            check,
        )?;
    }
    Ok(())
}

mod signature_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 32 bytes"))
    }
}
