//! First-party caveat language.
//!
//! Two conditions are understood:
//!
//! ```text
//! declared identity <tag>
//! time-before <RFC3339 timestamp>
//! ```
//!
//! Anything else fails closed.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::tag::Tag;

const DECLARED_IDENTITY: &str = "declared identity ";
const TIME_BEFORE: &str = "time-before ";

/// A parsed first-party caveat condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The macaroon asserts that its bearer is `Tag`.
    DeclaredIdentity(Tag),
    /// The macaroon is valid only before the given instant.
    TimeBefore(DateTime<Utc>),
}

impl Condition {
    /// Parses a condition string.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason for unknown or malformed conditions.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if let Some(rest) = raw.strip_prefix(DECLARED_IDENTITY) {
            let tag = Tag::parse(rest.trim()).map_err(|e| e.to_string())?;
            return Ok(Self::DeclaredIdentity(tag));
        }
        if let Some(rest) = raw.strip_prefix(TIME_BEFORE) {
            let at = DateTime::parse_from_rfc3339(rest.trim())
                .map_err(|e| format!("bad time-before timestamp: {e}"))?;
            return Ok(Self::TimeBefore(at.with_timezone(&Utc)));
        }
        Err("unrecognised caveat condition".to_string())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeclaredIdentity(tag) => write!(f, "{DECLARED_IDENTITY}{tag}"),
            Self::TimeBefore(at) => write!(f, "{TIME_BEFORE}{}", at.to_rfc3339()),
        }
    }
}

/// Accumulates the effect of every first-party caveat seen while verifying a
/// bundle.
#[derive(Debug)]
pub struct CaveatChecker {
    now: DateTime<Utc>,
    declared: Option<Tag>,
    expiry: Option<DateTime<Utc>>,
}

impl CaveatChecker {
    /// Creates a checker evaluating time caveats against `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            declared: None,
            expiry: None,
        }
    }

    /// Checks a single condition.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason.
    pub fn check(&mut self, raw: &str) -> Result<(), String> {
        match Condition::parse(raw)? {
            Condition::DeclaredIdentity(tag) => match &self.declared {
                Some(existing) if *existing != tag => Err(format!(
                    "conflicting identity declarations: {existing} and {tag}"
                )),
                _ => {
                    self.declared = Some(tag);
                    Ok(())
                },
            },
            Condition::TimeBefore(at) => {
                if self.now >= at {
                    return Err(format!("macaroon expired at {}", at.to_rfc3339()));
                }
                self.expiry = Some(self.expiry.map_or(at, |e| e.min(at)));
                Ok(())
            },
        }
    }

    /// Returns the declared identity, if any caveat declared one.
    #[must_use]
    pub fn declared_identity(&self) -> Option<&Tag> {
        self.declared.as_ref()
    }

    /// Consumes the checker, returning the identity and the earliest expiry.
    #[must_use]
    pub fn finish(self) -> (Option<Tag>, Option<DateTime<Utc>>) {
        (self.declared, self.expiry)
    }
}
