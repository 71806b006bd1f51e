//! Mode-gated restrictions.
//!
//! A [`RestrictionChain`] is an ordered list of (predicate, error) pairs
//! evaluated before any call reaches the root dispatcher. The first
//! restriction whose predicate rejects the (facade, method) pair decides the
//! error. The chain is chosen once, from the controller mode read at login,
//! and is never replaced for the life of the session.
//!
//! | Mode                | Reachable                                   | Otherwise             |
//! |---------------------|---------------------------------------------|-----------------------|
//! | `Normal`            | everything                                  |                       |
//! | `Upgrading`         | [`UPGRADE_ALLOWED`]                         | `UpgradeInProgress`   |
//! | `RestoreInProgress` | [`RESTORE_IN_PROGRESS_ALLOWED`]             | `RestoreInProgress`   |
//! | `AboutToRestore`    | [`ABOUT_TO_RESTORE_ALLOWED`]                | `RestoreInProgress`   |
//!
//! Every check is a pure table lookup; nothing here blocks.

use std::fmt;

use corral_core::ControllerMode;

use super::error::ApiError;

/// Facade methods reachable while the controller is upgrading.
pub const UPGRADE_ALLOWED: &[(&str, &str)] = &[
    ("Pinger", "Ping"),
    ("Client", "FullStatus"),
    ("Client", "ModelInfo"),
];

/// Facade methods reachable while a restore is running.
pub const RESTORE_IN_PROGRESS_ALLOWED: &[(&str, &str)] = &[
    ("Pinger", "Ping"),
    ("Backups", "RestoreStatus"),
    ("Backups", "AbortRestore"),
];

/// Facade methods reachable after a restore was requested but before it
/// started.
pub const ABOUT_TO_RESTORE_ALLOWED: &[(&str, &str)] = &[
    ("Pinger", "Ping"),
    ("Backups", "Restore"),
    ("Backups", "CancelRestore"),
];

fn listed(table: &[(&str, &str)], facade: &str, method: &str) -> bool {
    table.iter().any(|(f, m)| *f == facade && *m == method)
}

/// A single gate: calls for which `allows` returns `false` fail with
/// `reject()`.
#[derive(Clone, Copy)]
pub struct Restriction {
    name: &'static str,
    allows: fn(&str, &str) -> bool,
    reject: fn() -> ApiError,
}

impl Restriction {
    /// Creates a restriction.
    #[must_use]
    pub const fn new(
        name: &'static str,
        allows: fn(&str, &str) -> bool,
        reject: fn() -> ApiError,
    ) -> Self {
        Self {
            name,
            allows,
            reject,
        }
    }

    /// Returns the restriction's name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns `true` if the restriction lets the call through.
    #[must_use]
    pub fn allows(&self, facade: &str, method: &str) -> bool {
        (self.allows)(facade, method)
    }

    /// Returns the error for rejected calls.
    #[must_use]
    pub fn error(&self) -> ApiError {
        (self.reject)()
    }
}

impl fmt::Debug for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Restriction").field(&self.name).finish()
    }
}

const UPGRADE: Restriction = Restriction::new(
    "upgrade",
    |facade, method| listed(UPGRADE_ALLOWED, facade, method),
    || ApiError::UpgradeInProgress,
);

const RESTORE_IN_PROGRESS: Restriction = Restriction::new(
    "restore-in-progress",
    |facade, method| listed(RESTORE_IN_PROGRESS_ALLOWED, facade, method),
    || ApiError::RestoreInProgress,
);

const ABOUT_TO_RESTORE: Restriction = Restriction::new(
    "about-to-restore",
    |facade, method| listed(ABOUT_TO_RESTORE_ALLOWED, facade, method),
    || ApiError::RestoreInProgress,
);

/// Ordered restrictions applied before dispatch.
#[derive(Debug, Clone, Default)]
pub struct RestrictionChain {
    mode: ControllerMode,
    restrictions: Vec<Restriction>,
}

impl RestrictionChain {
    /// Builds the chain for `mode`.
    #[must_use]
    pub fn for_mode(mode: ControllerMode) -> Self {
        let restrictions = match mode {
            ControllerMode::Normal => Vec::new(),
            ControllerMode::Upgrading => vec![UPGRADE],
            ControllerMode::RestoreInProgress => vec![RESTORE_IN_PROGRESS],
            ControllerMode::AboutToRestore => vec![ABOUT_TO_RESTORE],
        };
        Self { mode, restrictions }
    }

    /// Appends a restriction evaluated after the existing ones.
    #[must_use]
    pub fn with(mut self, restriction: Restriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    /// Returns the mode the chain was built for.
    #[must_use]
    pub const fn mode(&self) -> ControllerMode {
        self.mode
    }

    /// Returns the restrictions in evaluation order.
    #[must_use]
    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    /// Checks a call against every restriction in order.
    ///
    /// # Errors
    ///
    /// Returns the error of the first restriction that rejects the call.
    pub fn check(&self, facade: &str, method: &str) -> Result<(), ApiError> {
        match self
            .restrictions
            .iter()
            .find(|r| !r.allows(facade, method))
        {
            Some(r) => Err(r.error()),
            None => Ok(()),
        }
    }

    /// Returns `true` if the call passes every restriction.
    #[must_use]
    pub fn allows(&self, facade: &str, method: &str) -> bool {
        self.check(facade, method).is_ok()
    }
}
