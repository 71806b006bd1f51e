//! Per-session resource registry.
//!
//! Long-lived server-side objects (watchers, streams) created by facade
//! methods are registered here and addressed by the client through an opaque
//! id. The registry is owned by the session; when the session ends every
//! remaining resource is stopped.
//!
//! # Invariants
//!
//! - [INV-RR-001] Ids are unique within a session and never reused.
//! - [INV-RR-002] [`ResourceRegistry::stop_all`] runs its teardown at most
//!   once; later calls are no-ops.
//! - [INV-RR-003] A resource that fails to stop is logged and skipped; the
//!   remaining resources are still stopped.
//! - [INV-RR-004] No lock is held while a resource is being stopped.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from resource lifecycle operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    /// No resource is registered under the id.
    #[error("resource {id:?} not found")]
    NotFound {
        /// The requested id.
        id: String,
    },

    /// The registry has been torn down.
    #[error("resource registry is closed")]
    Closed,

    /// The resource failed to stop cleanly.
    #[error("failed to stop resource {id:?}: {reason}")]
    StopFailed {
        /// The resource id.
        id: String,
        /// Why it failed.
        reason: String,
    },
}

/// A long-lived server-side handle.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// Short kind name for logging, e.g. `status-watcher`.
    fn kind(&self) -> &'static str;

    /// Releases the resource.
    ///
    /// # Errors
    ///
    /// Returns a reason if the resource could not be stopped cleanly.
    async fn stop(&self) -> Result<(), String>;

    /// Returns `self` as [`Any`] so facades can recover the concrete type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    closed: bool,
    resources: BTreeMap<String, Arc<dyn Resource>>,
}

/// Table of live resources for one session.
#[derive(Default)]
pub struct ResourceRegistry {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ResourceRegistry")
            .field("live", &inner.resources.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a resource and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Closed`] after teardown; the caller still
    /// owns the resource and must stop it.
    pub fn register(&self, resource: Arc<dyn Resource>) -> Result<String, ResourceError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ResourceError::Closed);
        }
        inner.next_id += 1;
        let id = inner.next_id.to_string();
        debug!(id = %id, kind = resource.kind(), "resource registered");
        inner.resources.insert(id.clone(), resource);
        Ok(id)
    }

    /// Returns the resource registered under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Resource>> {
        self.lock().resources.get(id).cloned()
    }

    /// Returns the resource under `id` downcast to `T`.
    #[must_use]
    pub fn get_as<T: Resource>(&self, id: &str) -> Option<Arc<T>> {
        self.get(id)?.into_any().downcast::<T>().ok()
    }

    /// Returns `true` if a resource is registered under `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().resources.contains_key(id)
    }

    /// Returns the number of live resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    /// Returns `true` if no resources are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and stops the resource under `id`.
    ///
    /// # Errors
    ///
    /// [`ResourceError::NotFound`] if nothing is registered under `id`, or
    /// [`ResourceError::StopFailed`] if the resource failed to stop (it is
    /// removed regardless).
    pub async fn stop(&self, id: &str) -> Result<(), ResourceError> {
        let resource = self
            .lock()
            .resources
            .remove(id)
            .ok_or_else(|| ResourceError::NotFound { id: id.to_string() })?;
        resource
            .stop()
            .await
            .map_err(|reason| ResourceError::StopFailed {
                id: id.to_string(),
                reason,
            })
    }

    /// Stops every resource and closes the registry.
    ///
    /// Returns the number of resources that failed to stop.
    pub async fn stop_all(&self) -> usize {
        let drained = {
            let mut inner = self.lock();
            if inner.closed {
                return 0;
            }
            inner.closed = true;
            std::mem::take(&mut inner.resources)
        };

        let mut failures = 0;
        for (id, resource) in drained {
            if let Err(reason) = resource.stop().await {
                failures += 1;
                warn!(id = %id, kind = resource.kind(), %reason, "resource failed to stop during teardown");
            }
        }
        failures
    }
}
