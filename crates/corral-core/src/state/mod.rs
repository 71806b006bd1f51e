//! Cluster-state store collaborator.
//!
//! The API server never owns persistent state. It reads entity records
//! through [`EntityStore`], which the controller backs with its cluster-state
//! database. [`InMemoryEntityStore`] is the implementation used by the bundled
//! binary (seeded from configuration) and by tests.
//!
//! # Invariants
//!
//! - Authentication only ever reads from the store.
//! - Every mutation of [`InMemoryEntityStore`] is published to subscribers
//!   after the write lock is released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::credentials::SecretHash;
use crate::tag::Tag;

/// Capacity of the change broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Errors returned by the cluster-state store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No record exists for the tag.
    #[error("entity {tag} not found")]
    NotFound {
        /// The missing entity.
        tag: Tag,
    },

    /// The store could not be reached.
    #[error("cluster-state store unavailable: {reason}")]
    Unavailable {
        /// Why the store is unavailable.
        reason: String,
    },
}

/// A stored authenticable principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity tag.
    pub tag: Tag,
    /// Salted hash of the entity's secret. External users have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<SecretHash>,
    /// Provisioning nonce recorded for machine agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl EntityRecord {
    /// Creates a record with a password hash and no nonce.
    #[must_use]
    pub const fn new(tag: Tag, password_hash: SecretHash) -> Self {
        Self {
            tag,
            password_hash: Some(password_hash),
            nonce: None,
        }
    }

    /// Sets the provisioning nonce.
    #[must_use]
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}

/// A change published by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A record was inserted or replaced.
    Upserted(Tag),
    /// A record was removed.
    Removed(Tag),
}

/// Read-side interface to the cluster-state store.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Returns the record for `tag`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no record exists, or
    /// [`StoreError::Unavailable`] if the store cannot be reached.
    async fn lookup_entity(&self, tag: &Tag) -> Result<EntityRecord, StoreError>;

    /// Returns `true` if a record exists for `tag`.
    async fn entity_exists(&self, tag: &Tag) -> Result<bool, StoreError>;

    /// Returns every entity tag, in tag order.
    async fn list_entities(&self) -> Result<Vec<Tag>, StoreError>;

    /// Checks that the store connection is alive.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Subscribes to record changes.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// An in-memory [`EntityStore`].
#[derive(Debug)]
pub struct InMemoryEntityStore {
    records: RwLock<BTreeMap<Tag, EntityRecord>>,
    available: AtomicBool,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEntityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            changes,
        }
    }

    /// Creates a store holding `records`.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = EntityRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.write().unwrap_or_else(PoisonError::into_inner);
            for record in records {
                map.insert(record.tag.clone(), record);
            }
        }
        store
    }

    /// Inserts or replaces a record.
    pub fn upsert(&self, record: EntityRecord) {
        let tag = record.tag.clone();
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag.clone(), record);
        // No subscribers is not an error.
        let _ = self.changes.send(StoreChange::Upserted(tag));
    }

    /// Removes a record, returning it if present.
    pub fn remove(&self, tag: &Tag) -> Option<EntityRecord> {
        let removed = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tag);
        if removed.is_some() {
            let _ = self.changes.send(StoreChange::Removed(tag.clone()));
        }
        removed
    }

    /// Simulates losing (or regaining) the store connection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "connection lost".to_string(),
            })
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn lookup_entity(&self, tag: &Tag) -> Result<EntityRecord, StoreError> {
        self.check_available()?;
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { tag: tag.clone() })
    }

    async fn entity_exists(&self, tag: &Tag) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tag))
    }

    async fn list_entities(&self) -> Result<Vec<Tag>, StoreError> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
