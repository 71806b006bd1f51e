//! Entity tags.
//!
//! Every authenticable principal and every addressable controller object is
//! named by a tag of the form `<kind>-<id>`:
//!
//! | Kind         | Example                     | Notes                              |
//! |--------------|-----------------------------|------------------------------------|
//! | `user`       | `user-admin`, `user-bob@ext`| domain defaults to `local`         |
//! | `machine`    | `machine-0`, `machine-3/lxd/1` | agents, container suffixes allowed |
//! | `unit`       | `unit-mysql-0`              | application name + unit number     |
//! | `model`      | `model-<uuid>`              |                                    |
//! | `controller` | `controller-<name>`         |                                    |
//!
//! Tags are parsed once at the edge (login request, config file) and carried
//! as [`Tag`] thereafter, so malformed names never reach the store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Domain assumed for user tags that carry no `@domain` suffix.
pub const LOCAL_DOMAIN: &str = "local";

/// Maximum accepted tag length in bytes.
pub const MAX_TAG_LEN: usize = 256;

/// Errors produced when parsing a tag.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TagError {
    /// The input is empty or exceeds [`MAX_TAG_LEN`].
    #[error("invalid tag length {len}")]
    InvalidLength {
        /// Length of the rejected input.
        len: usize,
    },

    /// The kind prefix is not recognised.
    #[error("unknown tag kind in {tag:?}")]
    UnknownKind {
        /// The rejected input.
        tag: String,
    },

    /// The id portion is malformed for the tag's kind.
    #[error("malformed {kind} tag {tag:?}")]
    Malformed {
        /// Tag kind that was recognised.
        kind: TagKind,
        /// The rejected input.
        tag: String,
    },
}

/// The kind of entity a tag names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagKind {
    /// A human (or external) user.
    User,
    /// A machine agent.
    Machine,
    /// A unit agent.
    Unit,
    /// A model.
    Model,
    /// A controller.
    Controller,
}

impl TagKind {
    /// Returns the prefix used in the string form.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Machine => "machine",
            Self::Unit => "unit",
            Self::Model => "model",
            Self::Controller => "controller",
        }
    }

    /// Returns `true` for kinds that run as agents rather than people.
    #[must_use]
    pub const fn is_agent(self) -> bool {
        matches!(self, Self::Machine | Self::Unit)
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "user" => Some(Self::User),
            "machine" => Some(Self::Machine),
            "unit" => Some(Self::Unit),
            "model" => Some(Self::Model),
            "controller" => Some(Self::Controller),
            _ => None,
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A parsed entity tag.
///
/// The canonical string form is preserved exactly as parsed so that
/// [`Tag::as_str`] round-trips, except that an explicit `@local` user domain
/// is normalised away.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    kind: TagKind,
    canonical: String,
}

impl Tag {
    /// Parses a tag from its string form.
    ///
    /// # Errors
    ///
    /// Returns [`TagError`] if the input is empty, too long, has an unknown
    /// kind prefix, or the id is malformed for that kind.
    pub fn parse(input: &str) -> Result<Self, TagError> {
        if input.is_empty() || input.len() > MAX_TAG_LEN {
            return Err(TagError::InvalidLength { len: input.len() });
        }
        let (prefix, id) = input.split_once('-').ok_or_else(|| TagError::UnknownKind {
            tag: input.to_string(),
        })?;
        let kind = TagKind::from_prefix(prefix).ok_or_else(|| TagError::UnknownKind {
            tag: input.to_string(),
        })?;
        let malformed = || TagError::Malformed {
            kind,
            tag: input.to_string(),
        };

        let canonical = match kind {
            TagKind::User => {
                let (name, domain) = match id.split_once('@') {
                    Some((name, domain)) => (name, Some(domain)),
                    None => (id, None),
                };
                if !is_valid_user_name(name) {
                    return Err(malformed());
                }
                match domain {
                    None => input.to_string(),
                    Some(LOCAL_DOMAIN) => format!("user-{name}"),
                    Some(domain) if is_valid_name(domain) => input.to_string(),
                    Some(_) => return Err(malformed()),
                }
            },
            TagKind::Machine => {
                if !is_valid_machine_id(id) {
                    return Err(malformed());
                }
                input.to_string()
            },
            TagKind::Unit => {
                let (app, number) = id.rsplit_once('-').ok_or_else(malformed)?;
                if !is_valid_name(app) || !is_number(number) {
                    return Err(malformed());
                }
                input.to_string()
            },
            TagKind::Model | TagKind::Controller => {
                if !is_valid_name(id) {
                    return Err(malformed());
                }
                input.to_string()
            },
        };

        Ok(Self { kind, canonical })
    }

    /// Builds a local user tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::Malformed`] if `name` is not a valid user name.
    pub fn user(name: &str) -> Result<Self, TagError> {
        Self::parse(&format!("user-{name}"))
    }

    /// Builds a machine tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::Malformed`] if `id` is not a valid machine id.
    pub fn machine(id: &str) -> Result<Self, TagError> {
        Self::parse(&format!("machine-{id}"))
    }

    /// Returns the tag kind.
    #[must_use]
    pub const fn kind(&self) -> TagKind {
        self.kind
    }

    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Returns the id portion (everything after `<kind>-`).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.canonical[self.kind.prefix().len() + 1..]
    }

    /// Returns the user domain, `local` when none was given.
    ///
    /// Returns `None` for non-user tags.
    #[must_use]
    pub fn user_domain(&self) -> Option<&str> {
        if self.kind != TagKind::User {
            return None;
        }
        Some(
            self.id()
                .split_once('@')
                .map_or(LOCAL_DOMAIN, |(_, domain)| domain),
        )
    }

    /// Returns `true` for user tags from a domain other than `local`.
    ///
    /// External users are vouched for by a third-party identity service and
    /// have no password record in the cluster-state store.
    #[must_use]
    pub fn is_external_user(&self) -> bool {
        self.user_domain().is_some_and(|d| d != LOCAL_DOMAIN)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for Tag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn is_valid_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

fn is_valid_user_name(s: &str) -> bool {
    is_valid_name(s) && s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Machine ids are a number optionally followed by `/<container-type>/<n>`
/// pairs, e.g. `0`, `3/lxd/1`, `3/lxd/1/kvm/0`.
fn is_valid_machine_id(s: &str) -> bool {
    let mut parts = s.split('/');
    if !parts.next().is_some_and(is_number) {
        return false;
    }
    let rest: Vec<&str> = parts.collect();
    rest.len() % 2 == 0
        && rest.chunks(2).all(|pair| {
            pair[0].chars().all(|c| c.is_ascii_lowercase()) && !pair[0].is_empty() && is_number(pair[1])
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_tags() {
        let tag = Tag::parse("user-admin").unwrap();
        assert_eq!(tag.kind(), TagKind::User);
        assert_eq!(tag.id(), "admin");
        assert_eq!(tag.user_domain(), Some("local"));
        assert!(!tag.is_external_user());

        let ext = Tag::parse("user-bob@external").unwrap();
        assert_eq!(ext.user_domain(), Some("external"));
        assert!(ext.is_external_user());
    }

    #[test]
    fn test_local_domain_is_normalised() {
        let tag = Tag::parse("user-admin@local").unwrap();
        assert_eq!(tag.as_str(), "user-admin");
        assert_eq!(tag, Tag::user("admin").unwrap());
    }

    #[test]
    fn test_parse_agent_tags() {
        assert_eq!(Tag::parse("machine-0").unwrap().kind(), TagKind::Machine);
        assert_eq!(Tag::parse("machine-3/lxd/1").unwrap().id(), "3/lxd/1");
        assert_eq!(Tag::parse("unit-mysql-0").unwrap().kind(), TagKind::Unit);
        assert!(TagKind::Machine.is_agent());
        assert!(!TagKind::User.is_agent());
    }

    #[test]
    fn test_rejects_malformed_tags() {
        assert!(matches!(Tag::parse(""), Err(TagError::InvalidLength { .. })));
        assert!(matches!(Tag::parse("admin"), Err(TagError::UnknownKind { .. })));
        assert!(matches!(Tag::parse("widget-1"), Err(TagError::UnknownKind { .. })));
        assert!(matches!(Tag::parse("machine-x"), Err(TagError::Malformed { .. })));
        assert!(matches!(Tag::parse("machine-3/lxd"), Err(TagError::Malformed { .. })));
        assert!(matches!(Tag::parse("unit-mysql"), Err(TagError::Malformed { .. })));
        assert!(matches!(Tag::parse("user-"), Err(TagError::Malformed { .. })));
        assert!(matches!(Tag::parse("user-bob@"), Err(TagError::Malformed { .. })));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let tag = Tag::parse("unit-mysql-0").unwrap();
        let json = serde_json::to_string(&tag).unwrap();
        assert_eq!(json, "\"unit-mysql-0\"");
        let back: Tag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tag);

        let bad: Result<Tag, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_oversized_tag_rejected() {
        let long = format!("user-{}", "a".repeat(MAX_TAG_LEN));
        assert!(matches!(Tag::parse(&long), Err(TagError::InvalidLength { .. })));
    }

    mod properties {
        use proptest::prelude::*;

        use super::super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            /// Arbitrary input never panics the parser.
            #[test]
            fn prop_parse_never_panics(input in ".{0,300}") {
                let _ = Tag::parse(&input);
            }

            /// A parsed tag re-parses to itself from its canonical form.
            #[test]
            fn prop_canonical_form_is_stable(
                kind in prop::sample::select(vec!["user", "machine", "unit", "model", "controller"]),
                id in "[a-z0-9][a-z0-9./@-]{0,20}",
            ) {
                if let Ok(tag) = Tag::parse(&format!("{kind}-{id}")) {
                    let again = Tag::parse(tag.as_str()).unwrap();
                    prop_assert_eq!(again, tag);
                }
            }
        }
    }
}
