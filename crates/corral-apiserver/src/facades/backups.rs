//! `Backups`: restore orchestration.
//!
//! A restore moves the controller through the restore modes:
//!
//! ```text
//!            PrepareRestore           Restore
//!   Normal ─────────────────► AboutToRestore ─────────► RestoreInProgress
//!     ▲                            │                          │
//!     └──────── CancelRestore ─────┘                          │
//!     └──────────────────────── AbortRestore ─────────────────┘
//! ```
//!
//! The state is process-wide and lives in [`RestoreCoordinator`], shared
//! by every session's `Backups` instance. Only sessions that log in after a
//! transition see the new mode's restrictions.

use std::sync::{Arc, Mutex, PoisonError};

use corral_core::{ControllerMode, ModeSink, ModeSource, SharedControllerMode, Tag};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::protocol::error::ApiError;
use crate::protocol::root::{FacadeContext, FacadeSpec};

/// Facade name.
pub const NAME: &str = "Backups";

/// Result of `Backups.RestoreStatus` and of every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStatus {
    /// Controller mode after the call.
    pub mode: ControllerMode,
    /// Backup being restored, once `Restore` has been called.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

/// Parameters of `Backups.Restore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestoreParams {
    /// Backup to restore from.
    pub backup_id: String,
}

/// Drives restore transitions of the shared controller mode.
#[derive(Debug)]
pub struct RestoreCoordinator {
    mode: SharedControllerMode,
    backup_id: Mutex<Option<String>>,
}

impl RestoreCoordinator {
    /// Creates a coordinator over `mode`.
    #[must_use]
    pub fn new(mode: SharedControllerMode) -> Self {
        Self {
            mode,
            backup_id: Mutex::new(None),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> RestoreStatus {
        let backup_id = self.backup_id.lock().unwrap_or_else(PoisonError::into_inner);
        RestoreStatus {
            mode: self.mode.current_mode(),
            backup_id: backup_id.clone(),
        }
    }

    /// Moves `from` to `to`, optionally recording the backup id.
    ///
    /// The backup-id lock serializes transitions, so two concurrent callers
    /// cannot both observe `from`.
    fn transition(
        &self,
        operation: &str,
        from: ControllerMode,
        to: ControllerMode,
        backup_id: Option<String>,
        by: &Tag,
    ) -> Result<RestoreStatus, ApiError> {
        let mut recorded = self.backup_id.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.mode.current_mode();
        if current != from {
            return Err(ApiError::bad_request(format!(
                "cannot {operation} while controller is {current}"
            )));
        }
        self.mode.set_mode(to);
        if to == ControllerMode::Normal {
            *recorded = None;
        } else if backup_id.is_some() {
            *recorded = backup_id;
        }
        info!(entity = %by, operation, %from, %to, "restore transition");
        Ok(RestoreStatus {
            mode: to,
            backup_id: recorded.clone(),
        })
    }
}

/// The `Backups` facade, bound to one session.
#[derive(Debug)]
pub struct Backups {
    entity: Tag,
    coordinator: Arc<RestoreCoordinator>,
}

impl Backups {
    /// Reports the restore state.
    #[allow(clippy::unused_async)]
    pub async fn restore_status(self: Arc<Self>, (): ()) -> Result<RestoreStatus, ApiError> {
        Ok(self.coordinator.status())
    }

    /// Requests a restore: `Normal` to `AboutToRestore`.
    #[allow(clippy::unused_async)]
    pub async fn prepare_restore(self: Arc<Self>, (): ()) -> Result<RestoreStatus, ApiError> {
        self.coordinator.transition(
            "prepare a restore",
            ControllerMode::Normal,
            ControllerMode::AboutToRestore,
            None,
            &self.entity,
        )
    }

    /// Confirms the restore: `AboutToRestore` to `RestoreInProgress`.
    #[allow(clippy::unused_async)]
    pub async fn restore(
        self: Arc<Self>,
        params: RestoreParams,
    ) -> Result<RestoreStatus, ApiError> {
        if params.backup_id.is_empty() {
            return Err(ApiError::bad_request("backup_id must not be empty"));
        }
        self.coordinator.transition(
            "start a restore",
            ControllerMode::AboutToRestore,
            ControllerMode::RestoreInProgress,
            Some(params.backup_id),
            &self.entity,
        )
    }

    /// Withdraws a pending restore: `AboutToRestore` to `Normal`.
    #[allow(clippy::unused_async)]
    pub async fn cancel_restore(self: Arc<Self>, (): ()) -> Result<RestoreStatus, ApiError> {
        self.coordinator.transition(
            "cancel a restore",
            ControllerMode::AboutToRestore,
            ControllerMode::Normal,
            None,
            &self.entity,
        )
    }

    /// Abandons a running restore: `RestoreInProgress` to `Normal`.
    #[allow(clippy::unused_async)]
    pub async fn abort_restore(self: Arc<Self>, (): ()) -> Result<RestoreStatus, ApiError> {
        self.coordinator.transition(
            "abort a restore",
            ControllerMode::RestoreInProgress,
            ControllerMode::Normal,
            None,
            &self.entity,
        )
    }
}

/// Builds `Backups` version 1.
#[must_use]
pub fn facade(coordinator: Arc<RestoreCoordinator>) -> FacadeSpec {
    FacadeSpec::builder(NAME, 1, move |ctx: &FacadeContext| {
        Ok(Backups {
            entity: ctx.entity.clone(),
            coordinator: Arc::clone(&coordinator),
        })
    })
    .method("RestoreStatus", Backups::restore_status)
    .method("PrepareRestore", Backups::prepare_restore)
    .method("Restore", Backups::restore)
    .method("CancelRestore", Backups::cancel_restore)
    .method("AbortRestore", Backups::abort_restore)
    .build()
}
