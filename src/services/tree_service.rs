//! TreeService: owner-scoped access to video trees.
//!
//! Every mutation runs load, change, save under a per-tree lock so two
//! requests adding branches to the same tree cannot lose each other's write.
//! Different trees never contend.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    models::tree::{Node, NodeId, NodeInfo, TreeError, TreeId, VideoTree},
    services::{
        gateway::{GatewayError, ObjectGateway},
        tree_repository::{RepositoryError, TreeRepository},
    },
};

#[derive(Debug, Error)]
pub enum TreeServiceError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Repository(RepositoryError),
    #[error(transparent)]
    Storage(#[from] GatewayError),
}

impl From<RepositoryError> for TreeServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Tree(err) => TreeServiceError::Tree(err),
            other => TreeServiceError::Repository(other),
        }
    }
}

pub type TreeResult<T> = Result<T, TreeServiceError>;

/// One async mutex per tree, created on first use.
#[derive(Clone, Default)]
struct TreeLocks {
    locks: Arc<Mutex<HashMap<TreeId, Arc<AsyncMutex<()>>>>>,
}

impl TreeLocks {
    async fn acquire(&self, tree_id: TreeId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(tree_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn forget(&self, tree_id: &TreeId) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(tree_id);
    }
}

#[derive(Clone)]
pub struct TreeService {
    repository: TreeRepository,
    gateway: Arc<dyn ObjectGateway>,
    locks: TreeLocks,
}

impl TreeService {
    pub fn new(repository: TreeRepository, gateway: Arc<dyn ObjectGateway>) -> Self {
        Self {
            repository,
            gateway,
            locks: TreeLocks::default(),
        }
    }

    pub async fn create_tree(&self, owner_id: Uuid, title: &str) -> TreeResult<VideoTree> {
        let tree = VideoTree::new(owner_id, title);
        self.repository.insert_tree(&tree).await?;
        info!(tree_id = %tree.id, %owner_id, "created tree");
        Ok(tree)
    }

    /// Load a tree the caller owns. Someone else's tree reads as not found.
    pub async fn get_tree(&self, owner_id: Uuid, tree_id: TreeId) -> TreeResult<VideoTree> {
        match self.repository.load_tree(tree_id).await? {
            Some(tree) if tree.owner_id == owner_id => Ok(tree),
            _ => Err(TreeError::TreeNotFound(tree_id).into()),
        }
    }

    /// Fails with `NodeNotFound` unless `node_id` is part of the caller's tree.
    pub async fn ensure_node(&self, owner_id: Uuid, tree_id: TreeId, node_id: NodeId) -> TreeResult<()> {
        let tree = self.get_tree(owner_id, tree_id).await?;
        if tree.contains(&node_id) {
            Ok(())
        } else {
            Err(TreeError::NodeNotFound {
                tree: tree_id,
                node: node_id,
            }
            .into())
        }
    }

    pub async fn add_child(
        &self,
        owner_id: Uuid,
        tree_id: TreeId,
        parent_id: NodeId,
        info: NodeInfo,
    ) -> TreeResult<Node> {
        let _guard = self.locks.acquire(tree_id).await;
        let mut tree = self.get_tree(owner_id, tree_id).await?;

        let child = tree.add_child(parent_id, info)?.clone();
        let parent = tree.node(&parent_id).ok_or(TreeError::NodeNotFound {
            tree: tree_id,
            node: parent_id,
        })?;
        self.repository.save_nodes(tree_id, &[parent, &child]).await?;

        debug!(%tree_id, %parent_id, node_id = %child.id, depth = child.depth, "added node");
        Ok(child)
    }

    /// Record the object key of a finished upload on its node.
    ///
    /// When the node already pointed at a different object, that object is
    /// removed from the store once the new key is saved. Failing to remove it
    /// is logged only; tree deletion sweeps it up later.
    pub async fn attach_storage_key(
        &self,
        owner_id: Uuid,
        tree_id: TreeId,
        node_id: NodeId,
        storage_key: &str,
    ) -> TreeResult<Node> {
        let _guard = self.locks.acquire(tree_id).await;
        let mut tree = self.get_tree(owner_id, tree_id).await?;

        let previous = tree
            .node(&node_id)
            .and_then(|node| node.info.storage_key.clone())
            .filter(|key| key != storage_key);
        let node = tree.attach_storage_key(node_id, storage_key)?.clone();
        self.repository.save_nodes(tree_id, &[&node]).await?;
        debug!(%tree_id, %node_id, key = storage_key, "attached storage key");

        if let Some(previous) = previous {
            match self.gateway.delete_object(&previous).await {
                Ok(()) | Err(GatewayError::ObjectNotFound(_)) => {
                    debug!(%tree_id, %node_id, key = %previous, "removed superseded object");
                }
                Err(err) => {
                    warn!(%tree_id, %node_id, key = %previous, "failed to remove superseded object: {}", err);
                }
            }
        }
        Ok(node)
    }

    /// Nodes in breadth-first order.
    pub async fn traverse(&self, owner_id: Uuid, tree_id: TreeId) -> TreeResult<Vec<Node>> {
        let tree = self.get_tree(owner_id, tree_id).await?;
        Ok(tree.traverse().cloned().collect())
    }

    /// Delete a tree, every stored object its nodes reference and the
    /// `extra_keys` the caller knows belong to it (objects of completed
    /// uploads that a node no longer points at).
    ///
    /// Objects already missing from the store are skipped. Returns the number
    /// of objects deleted. Open upload sessions are the caller's concern.
    pub async fn delete_tree(
        &self,
        owner_id: Uuid,
        tree_id: TreeId,
        extra_keys: impl IntoIterator<Item = String>,
    ) -> TreeResult<usize> {
        let guard = self.locks.acquire(tree_id).await;
        let tree = self.get_tree(owner_id, tree_id).await?;

        let keys: BTreeSet<String> = tree.storage_keys().into_iter().chain(extra_keys).collect();
        let mut deleted = 0;
        for key in keys {
            match self.gateway.delete_object(&key).await {
                Ok(()) => deleted += 1,
                Err(GatewayError::ObjectNotFound(_)) => {
                    debug!(%tree_id, key, "object of tree was already gone");
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.repository.delete_tree(tree_id).await?;
        drop(guard);
        self.locks.forget(&tree_id);

        info!(%tree_id, objects = deleted, "deleted tree");
        Ok(deleted)
    }
}
