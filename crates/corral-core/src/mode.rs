//! Controller lifecycle mode.
//!
//! The controller's lifecycle manager (upgrade and restore orchestration,
//! external to the API server) moves the process between modes. The API
//! server only ever reads the mode, once per login, through [`ModeSource`].
//!
//! # Invariants
//!
//! - Mode reads and writes are single atomic operations; no lock is held.
//! - A mode change never alters sessions that already logged in; the
//!   dispatcher fixes its restriction chain at login time.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// The controller's current operational mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ControllerMode {
    /// All facades are reachable.
    #[default]
    Normal           = 0,
    /// An upgrade is running; only upgrade-safe methods are reachable.
    Upgrading        = 1,
    /// A restore is running; only restore query/abort methods are reachable.
    RestoreInProgress = 2,
    /// A restore was requested but has not begun; only confirm/cancel are
    /// reachable.
    AboutToRestore   = 3,
}

impl ControllerMode {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Upgrading,
            2 => Self::RestoreInProgress,
            3 => Self::AboutToRestore,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Upgrading => "upgrading",
            Self::RestoreInProgress => "restore-in-progress",
            Self::AboutToRestore => "about-to-restore",
        };
        f.write_str(s)
    }
}

/// Read side of the controller mode, consumed by the API server.
pub trait ModeSource: Send + Sync {
    /// Returns the mode in effect right now.
    fn current_mode(&self) -> ControllerMode;
}

/// Write side of the controller mode, held by the lifecycle manager.
pub trait ModeSink: Send + Sync {
    /// Replaces the current mode.
    fn set_mode(&self, mode: ControllerMode);
}

/// Process-wide controller mode backed by a single atomic.
///
/// Cloning shares the underlying cell, so the lifecycle manager and the API
/// server can each hold a handle.
#[derive(Debug, Clone, Default)]
pub struct SharedControllerMode {
    cell: Arc<AtomicU8>,
}

impl SharedControllerMode {
    /// Creates a mode cell starting in `initial`.
    #[must_use]
    pub fn new(initial: ControllerMode) -> Self {
        Self {
            cell: Arc::new(AtomicU8::new(initial as u8)),
        }
    }
}

impl ModeSource for SharedControllerMode {
    fn current_mode(&self) -> ControllerMode {
        ControllerMode::from_u8(self.cell.load(Ordering::Acquire))
    }
}

impl ModeSink for SharedControllerMode {
    fn set_mode(&self, mode: ControllerMode) {
        let previous = ControllerMode::from_u8(self.cell.swap(mode as u8, Ordering::AcqRel));
        if previous != mode {
            tracing::info!(%previous, current = %mode, "controller mode changed");
        }
    }
}

/// A mode source that always reports the same mode. Test helper.
#[derive(Debug, Clone, Copy)]
pub struct FixedMode(pub ControllerMode);

impl ModeSource for FixedMode {
    fn current_mode(&self) -> ControllerMode {
        self.0
    }
}
