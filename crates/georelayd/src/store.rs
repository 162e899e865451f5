//! Group store port and its in-memory adapter.
//!
//! A deployment that wants pooling groups visible outside the relay process
//! implements [`GroupStore`] against its database. [`GroupMirror`] keeps a
//! store in step with the registry by following [`RegistryEvent`]s on its
//! own task, so a slow store never stalls the registry's command stream.
//!
//! When a store call fails, the affected client is sent a generic server
//! error. Nothing else is affected: the in-memory grouping stays
//! authoritative.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use georelay_core::{ClientId, GeoBounds, GroupId, Position};
use georelay_protocol::{codes, text, ServerMessage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::grouping::GroupView;
use crate::registry::{RegistryEvent, RegistryHandle};

/// A group as persisted by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredGroup {
    pub id: GroupId,
    pub anchor: Position,
    pub members: Vec<ClientId>,
    pub updated_at: DateTime<Utc>,
}

impl From<&GroupView> for StoredGroup {
    fn from(view: &GroupView) -> Self {
        Self {
            id: view.id.clone(),
            anchor: view.anchor,
            members: view.members.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// Errors that can occur in group store operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("group not found: {0}")]
    NotFound(GroupId),

    #[error("group already exists: {0}")]
    AlreadyExists(GroupId),

    /// Backend communication error
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence port for pooling groups.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Finds a group with room for one more member whose anchor lies inside
    /// `bounds`. Ties go to the earliest-updated group.
    async fn find_candidate_group(
        &self,
        bounds: GeoBounds,
        capacity: usize,
    ) -> Result<Option<StoredGroup>, StoreError>;

    async fn create_group(&self, group: StoredGroup) -> Result<(), StoreError>;

    async fn update_group(&self, group: StoredGroup) -> Result<(), StoreError>;

    async fn delete_group(&self, id: &GroupId) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// Process-local [`GroupStore`].
#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    groups: RwLock<HashMap<GroupId, StoredGroup>>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &GroupId) -> Option<StoredGroup> {
        self.groups.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.groups.read().await.is_empty()
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn find_candidate_group(
        &self,
        bounds: GeoBounds,
        capacity: usize,
    ) -> Result<Option<StoredGroup>, StoreError> {
        let groups = self.groups.read().await;
        Ok(groups
            .values()
            .filter(|g| g.members.len() < capacity && bounds.contains(&g.anchor))
            .min_by_key(|g| g.updated_at)
            .cloned())
    }

    async fn create_group(&self, group: StoredGroup) -> Result<(), StoreError> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(&group.id) {
            return Err(StoreError::AlreadyExists(group.id));
        }
        groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn update_group(&self, group: StoredGroup) -> Result<(), StoreError> {
        let mut groups = self.groups.write().await;
        match groups.get_mut(&group.id) {
            Some(slot) => {
                *slot = group;
                Ok(())
            }
            None => Err(StoreError::NotFound(group.id)),
        }
    }

    async fn delete_group(&self, id: &GroupId) -> Result<(), StoreError> {
        self.groups
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

// ============================================================================
// Group Mirror
// ============================================================================

/// Follows registry group events and writes them to a [`GroupStore`].
pub struct GroupMirror<S: GroupStore + 'static> {
    store: Arc<S>,
    registry: RegistryHandle,
}

impl<S: GroupStore + 'static> GroupMirror<S> {
    pub fn new(store: Arc<S>, registry: RegistryHandle) -> Self {
        Self { store, registry }
    }

    /// Subscribes to the registry and mirrors events until cancelled or
    /// the registry goes away.
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            info!("Group mirror started");
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Group mirror shutting down");
                        break;
                    }

                    result = events.recv() => {
                        match result {
                            Ok(event) => self.apply(event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Group mirror lagged, skipped events");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                debug!("Registry event channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn apply(&self, event: RegistryEvent) {
        let (client_id, result) = match event {
            RegistryEvent::GroupCreated { group, client_id } => {
                (client_id, self.store.create_group(StoredGroup::from(&group)).await)
            }
            RegistryEvent::GroupJoined { group, client_id }
            | RegistryEvent::GroupLeft { group, client_id } => {
                (client_id, self.store.update_group(StoredGroup::from(&group)).await)
            }
            RegistryEvent::GroupDeleted { group_id, client_id } => {
                (client_id, self.store.delete_group(&group_id).await)
            }
            RegistryEvent::ClientRegistered { .. } | RegistryEvent::ClientRemoved { .. } => return,
        };

        if let Err(e) = result {
            warn!(client_id = %client_id, error = %e, "Group store write failed");
            self.registry
                .notify(
                    client_id,
                    ServerMessage::error_with_code(text::SERVER_ERROR, codes::SERVER_ERROR),
                )
                .await;
        }
    }
}
