//! `StatusWatcher`: a resource-backed facade over entity changes.
//!
//! `Client.WatchStatus` registers a [`StatusWatcher`] in the session's
//! resource registry. The watcher's task follows the cluster-state store's
//! change feed, pushes each change to the client as a notification, and
//! buffers it for `StatusWatcher.Next`. The watcher lives until the client
//! calls `StatusWatcher.Stop` or the session ends.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use corral_core::state::{EntityStore, StoreChange};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::error::ApiError;
use crate::protocol::notifier::Notifier;
use crate::protocol::resources::{Resource, ResourceError, ResourceRegistry};
use crate::protocol::root::{FacadeContext, FacadeSpec};

/// Facade name.
pub const NAME: &str = "StatusWatcher";

/// Upper bound on changes buffered between two `Next` calls.
pub const MAX_BUFFERED_CHANGES: usize = 1024;

/// One entity change as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// The entity that changed.
    pub entity: String,
    /// Whether the entity still exists.
    pub removed: bool,
}

impl From<StoreChange> for StatusChange {
    fn from(change: StoreChange) -> Self {
        match change {
            StoreChange::Upserted(tag) => Self {
                entity: tag.to_string(),
                removed: false,
            },
            StoreChange::Removed(tag) => Self {
                entity: tag.to_string(),
                removed: true,
            },
        }
    }
}

/// Result of `StatusWatcher.Next`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanges {
    /// Changes since the previous call, oldest first.
    pub changes: Vec<StatusChange>,
    /// `true` if changes were dropped because the buffer overflowed or the
    /// watcher fell behind the store.
    #[serde(default)]
    pub missed: bool,
}

#[derive(Default)]
struct Buffer {
    changes: Vec<StatusChange>,
    missed: bool,
}

/// A live watch over entity changes.
pub struct StatusWatcher {
    buffer: Mutex<Buffer>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StatusWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWatcher")
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StatusWatcher {
    /// Registers a watcher in `resources` and starts following `store`.
    ///
    /// Returns the resource id.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Cancelled`] if the session is already tearing
    /// down.
    pub fn spawn(
        store: &Arc<dyn EntityStore>,
        resources: &ResourceRegistry,
        notifier: Notifier,
    ) -> Result<String, ApiError> {
        // Subscribe before registering so no change between the two is lost.
        let feed = store.subscribe();
        let watcher = Arc::new(Self {
            buffer: Mutex::new(Buffer::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });
        let id = resources
            .register(Arc::clone(&watcher) as Arc<dyn Resource>)
            .map_err(|_| ApiError::Cancelled)?;

        let task = tokio::spawn(follow(Arc::clone(&watcher), feed, notifier, id.clone()));
        *watcher.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(id)
    }

    /// Returns and clears the buffered changes.
    #[must_use]
    pub fn drain(&self) -> StatusChanges {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        StatusChanges {
            changes: std::mem::take(&mut buffer.changes),
            missed: std::mem::take(&mut buffer.missed),
        }
    }

    fn record(&self, change: StatusChange) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.changes.len() >= MAX_BUFFERED_CHANGES {
            buffer.missed = true;
        } else {
            buffer.changes.push(change);
        }
    }

    fn record_missed(&self) {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).missed = true;
    }
}

async fn follow(
    watcher: Arc<StatusWatcher>,
    mut feed: broadcast::Receiver<StoreChange>,
    notifier: Notifier,
    id: String,
) {
    loop {
        let received = tokio::select! {
            biased;
            () = watcher.cancel.cancelled() => return,
            received = feed.recv() => received,
        };
        let change = match received {
            Ok(change) => StatusChange::from(change),
            Err(RecvError::Lagged(skipped)) => {
                warn!(id = %id, skipped, "status watcher fell behind the store");
                watcher.record_missed();
                continue;
            },
            Err(RecvError::Closed) => {
                debug!(id = %id, "store change feed closed");
                return;
            },
        };
        watcher.record(change.clone());

        let payload = serde_json::json!({ "changes": [change] });
        let pushed = tokio::select! {
            biased;
            () = watcher.cancel.cancelled() => return,
            pushed = notifier.notify(NAME, &id, payload) => pushed,
        };
        if pushed.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Resource for StatusWatcher {
    fn kind(&self) -> &'static str {
        "status-watcher"
    }

    async fn stop(&self) -> Result<(), String> {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        match task {
            Some(task) => task.await.map_err(|e| format!("watcher task failed: {e}")),
            None => Ok(()),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The `StatusWatcher` facade, bound to one watcher.
#[derive(Debug)]
pub struct StatusWatcherFacade {
    id: String,
    watcher: Arc<StatusWatcher>,
    resources: Arc<ResourceRegistry>,
}

impl StatusWatcherFacade {
    fn new(ctx: &FacadeContext) -> Result<Self, ApiError> {
        let watcher = ctx
            .resources
            .get_as::<StatusWatcher>(&ctx.id)
            .ok_or_else(|| ApiError::UnknownId {
                facade: NAME.to_string(),
                id: ctx.id.clone(),
            })?;
        Ok(Self {
            id: ctx.id.clone(),
            watcher,
            resources: Arc::clone(&ctx.resources),
        })
    }

    /// Returns the changes buffered since the previous call.
    #[allow(clippy::unused_async)]
    pub async fn next(self: Arc<Self>, (): ()) -> Result<StatusChanges, ApiError> {
        Ok(self.watcher.drain())
    }

    /// Stops the watcher and releases its id.
    pub async fn stop(self: Arc<Self>, (): ()) -> Result<(), ApiError> {
        match self.resources.stop(&self.id).await {
            Ok(()) => Ok(()),
            Err(ResourceError::NotFound { id }) => Err(ApiError::UnknownId {
                facade: NAME.to_string(),
                id,
            }),
            Err(e) => Err(ApiError::internal(e.to_string())),
        }
    }
}

/// Builds `StatusWatcher` version 1.
#[must_use]
pub fn facade() -> FacadeSpec {
    FacadeSpec::builder(NAME, 1, StatusWatcherFacade::new)
        .resource_backed()
        .method("Next", StatusWatcherFacade::next)
        .method("Stop", StatusWatcherFacade::stop)
        .build()
}
