//! Built-in facades.
//!
//! | Facade          | Version | Methods                                                        |
//! |-----------------|---------|----------------------------------------------------------------|
//! | `Pinger`        | 1       | `Ping`                                                         |
//! | `Client`        | 1       | `FullStatus`, `ModelInfo`, `WatchStatus`, `DestroyRelation`    |
//! | `StatusWatcher` | 1       | `Next`, `Stop` (resource-backed)                               |
//! | `Backups`       | 1       | `RestoreStatus`, `PrepareRestore`, `Restore`, `CancelRestore`, `AbortRestore` |

pub mod backups;
pub mod client;
pub mod pinger;
pub mod status_watcher;

use std::sync::Arc;

use corral_core::Tag;
use corral_core::state::EntityStore;

pub use backups::RestoreCoordinator;

use crate::protocol::root::{FacadeRegistry, RegistrationError};

/// Builds the registry of every built-in facade.
///
/// # Errors
///
/// Returns [`RegistrationError`] if two built-ins collide.
pub fn standard_facades(
    store: Arc<dyn EntityStore>,
    controller_tag: Tag,
    restore: Arc<RestoreCoordinator>,
) -> Result<FacadeRegistry, RegistrationError> {
    let mut registry = FacadeRegistry::new();
    registry.register(pinger::facade())?;
    registry.register(client::facade(store, controller_tag))?;
    registry.register(status_watcher::facade())?;
    registry.register(backups::facade(restore))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use corral_core::ControllerMode;
    use corral_core::SharedControllerMode;
    use corral_core::state::InMemoryEntityStore;

    use super::*;
    use crate::protocol::restrictions::RestrictionChain;

    fn registry() -> FacadeRegistry {
        standard_facades(
            Arc::new(InMemoryEntityStore::new()),
            Tag::parse("controller-corral").unwrap(),
            Arc::new(RestoreCoordinator::new(SharedControllerMode::default())),
        )
        .unwrap()
    }

    #[test]
    fn test_every_mode_can_reach_pinger() {
        let registry = registry();
        for mode in [
            ControllerMode::Normal,
            ControllerMode::Upgrading,
            ControllerMode::RestoreInProgress,
            ControllerMode::AboutToRestore,
        ] {
            let reachable = registry.describe(&RestrictionChain::for_mode(mode));
            assert!(
                reachable.iter().any(|f| f.name == pinger::NAME),
                "Pinger unreachable in {mode}"
            );
        }
    }

    #[test]
    fn test_restore_modes_expose_backups_only() {
        let registry = registry();
        let names = |mode| {
            registry
                .describe(&RestrictionChain::for_mode(mode))
                .into_iter()
                .map(|f| f.name)
                .collect::<Vec<_>>()
        };
        assert_eq!(names(ControllerMode::RestoreInProgress), vec!["Backups", "Pinger"]);
        assert_eq!(names(ControllerMode::AboutToRestore), vec!["Backups", "Pinger"]);
        assert_eq!(names(ControllerMode::Upgrading), vec!["Client", "Pinger"]);
        assert_eq!(names(ControllerMode::Normal).len(), 4);
    }
}
