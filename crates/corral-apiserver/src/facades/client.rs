//! `Client`: the general-purpose facade used by command-line clients.
//!
//! `FullStatus` and `ModelInfo` are read-only and stay reachable while the
//! controller upgrades. `WatchStatus` creates a [`StatusWatcher`] resource.
//! `DestroyRelation` validates its arguments only; relation management
//! itself lives outside the API server.

use std::collections::BTreeMap;
use std::sync::Arc;

use corral_core::Tag;
use corral_core::state::{EntityStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::status_watcher::StatusWatcher;
use crate::protocol::error::ApiError;
use crate::protocol::notifier::Notifier;
use crate::protocol::resources::ResourceRegistry;
use crate::protocol::root::{FacadeContext, FacadeSpec};

/// Facade name.
pub const NAME: &str = "Client";

/// Result of `Client.FullStatus`: entity tags grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullStatus {
    /// Tags per kind prefix (`machine`, `unit`, `user`, ...), each sorted.
    pub entities: BTreeMap<String, Vec<String>>,
}

/// Result of `Client.ModelInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// The controller hosting the model.
    pub controller_tag: String,
    /// Number of entities known to the store.
    pub entity_count: usize,
    /// The entity that asked.
    pub requested_by: String,
}

/// Result of `Client.WatchStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchStatusResult {
    /// Id to pass to the `StatusWatcher` facade.
    pub watcher_id: String,
}

/// Parameters of `Client.DestroyRelation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestroyRelationParams {
    /// The two `application:endpoint` ends of the relation.
    pub endpoints: Vec<String>,
}

/// The `Client` facade, bound to one session.
pub struct Client {
    entity: Tag,
    controller_tag: Tag,
    store: Arc<dyn EntityStore>,
    resources: Arc<ResourceRegistry>,
    notifier: Notifier,
    connection_id: u64,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("entity", &self.entity)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

fn store_error(err: &StoreError) -> ApiError {
    error!(error = %err, "cluster-state store failure in Client facade");
    ApiError::internal(err.to_string())
}

impl Client {
    /// Returns every entity grouped by kind.
    pub async fn full_status(self: Arc<Self>, (): ()) -> Result<FullStatus, ApiError> {
        let tags = self.store.list_entities().await.map_err(|e| store_error(&e))?;
        let mut status = FullStatus::default();
        for tag in tags {
            status
                .entities
                .entry(tag.kind().prefix().to_string())
                .or_default()
                .push(tag.to_string());
        }
        Ok(status)
    }

    /// Returns summary information about the model.
    pub async fn model_info(self: Arc<Self>, (): ()) -> Result<ModelInfo, ApiError> {
        let tags = self.store.list_entities().await.map_err(|e| store_error(&e))?;
        Ok(ModelInfo {
            controller_tag: self.controller_tag.to_string(),
            entity_count: tags.len(),
            requested_by: self.entity.to_string(),
        })
    }

    /// Starts a status watcher.
    #[allow(clippy::unused_async)]
    pub async fn watch_status(self: Arc<Self>, (): ()) -> Result<WatchStatusResult, ApiError> {
        let watcher_id = StatusWatcher::spawn(&self.store, &self.resources, self.notifier.clone())?;
        info!(
            connection_id = self.connection_id,
            entity = %self.entity,
            watcher_id = %watcher_id,
            "status watcher started"
        );
        Ok(WatchStatusResult { watcher_id })
    }

    /// Validates a relation removal request and logs it.
    ///
    /// Performs no state change: the cluster-state store is left untouched
    /// and success only means the endpoints are well formed.
    #[allow(clippy::unused_async)]
    pub async fn destroy_relation(
        self: Arc<Self>,
        params: DestroyRelationParams,
    ) -> Result<(), ApiError> {
        let [a, b] = params.endpoints.as_slice() else {
            return Err(ApiError::bad_request(format!(
                "a relation has exactly two endpoints, got {}",
                params.endpoints.len()
            )));
        };
        for endpoint in [a, b] {
            let valid = endpoint
                .split_once(':')
                .is_some_and(|(app, name)| !app.is_empty() && !name.is_empty());
            if !valid {
                return Err(ApiError::bad_request(format!(
                    "endpoint {endpoint:?} is not of the form application:name"
                )));
            }
        }
        info!(
            connection_id = self.connection_id,
            entity = %self.entity,
            relation = %format!("{a} {b}"),
            "relation removal requested"
        );
        Ok(())
    }
}

/// Builds `Client` version 1.
#[must_use]
pub fn facade(store: Arc<dyn EntityStore>, controller_tag: Tag) -> FacadeSpec {
    FacadeSpec::builder(NAME, 1, move |ctx: &FacadeContext| {
        Ok(Client {
            entity: ctx.entity.clone(),
            controller_tag: controller_tag.clone(),
            store: Arc::clone(&store),
            resources: Arc::clone(&ctx.resources),
            notifier: ctx.notifier.clone(),
            connection_id: ctx.connection_id,
        })
    })
    .method("FullStatus", Client::full_status)
    .method("ModelInfo", Client::model_info)
    .method("WatchStatus", Client::watch_status)
    .method("DestroyRelation", Client::destroy_relation)
    .build()
}
