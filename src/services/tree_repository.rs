//! SQLite persistence for video trees.
//!
//! A tree is one `trees` row plus one `nodes` row per node. Child order is
//! stored on the parent as a JSON array so branch order survives a reload.

use chrono::{DateTime, Utc};
use sqlx::{SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::tree::{Node, NodeId, NodeInfo, NodeStatus, TreeError, TreeId, VideoTree};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt node record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

#[derive(sqlx::FromRow, Debug)]
struct TreeRow {
    owner_id: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Debug)]
struct NodeRow {
    id: Uuid,
    parent_id: Option<Uuid>,
    depth: i64,
    title: String,
    duration_secs: f64,
    storage_key: Option<String>,
    status: String,
    children: String,
}

impl NodeRow {
    fn into_node(self) -> Result<Node, RepositoryError> {
        let depth = u32::try_from(self.depth)
            .map_err(|_| RepositoryError::Corrupt(format!("node `{}` depth {}", self.id, self.depth)))?;
        let status = NodeStatus::parse(&self.status).ok_or_else(|| {
            RepositoryError::Corrupt(format!("node `{}` status `{}`", self.id, self.status))
        })?;
        let children: Vec<NodeId> = serde_json::from_str(&self.children)?;

        Ok(Node {
            id: self.id,
            parent_id: self.parent_id,
            depth,
            info: NodeInfo {
                title: self.title,
                duration_secs: self.duration_secs,
                storage_key: self.storage_key,
                status,
            },
            children,
        })
    }
}

#[derive(Clone)]
pub struct TreeRepository {
    db: Arc<SqlitePool>,
}

impl TreeRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Persist a brand-new tree with all of its nodes.
    pub async fn insert_tree(&self, tree: &VideoTree) -> Result<(), RepositoryError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("INSERT INTO trees (id, owner_id, created_at) VALUES (?, ?, ?)")
            .bind(tree.id)
            .bind(tree.owner_id)
            .bind(tree.created_at)
            .execute(&mut *tx)
            .await?;
        for node in tree.traverse() {
            upsert_node(&mut tx, tree.id, node).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Load and validate a tree. `Ok(None)` if it does not exist.
    pub async fn load_tree(&self, tree_id: TreeId) -> Result<Option<VideoTree>, RepositoryError> {
        let Some(row) = sqlx::query_as::<_, TreeRow>("SELECT owner_id, created_at FROM trees WHERE id = ?")
            .bind(tree_id)
            .fetch_optional(&*self.db)
            .await?
        else {
            return Ok(None);
        };

        let node_rows = sqlx::query_as::<_, NodeRow>(
            "SELECT id, parent_id, depth, title, duration_secs, storage_key, status, children
             FROM nodes WHERE tree_id = ?",
        )
        .bind(tree_id)
        .fetch_all(&*self.db)
        .await?;

        let nodes = node_rows
            .into_iter()
            .map(NodeRow::into_node)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(VideoTree::from_nodes(
            tree_id,
            row.owner_id,
            row.created_at,
            nodes,
        )?))
    }

    /// Write the given nodes of an existing tree in one transaction.
    pub async fn save_nodes(&self, tree_id: TreeId, nodes: &[&Node]) -> Result<(), RepositoryError> {
        let mut tx = self.db.begin().await?;
        for node in nodes {
            upsert_node(&mut tx, tree_id, node).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove a tree and its nodes. Returns false if it did not exist.
    pub async fn delete_tree(&self, tree_id: TreeId) -> Result<bool, RepositoryError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM nodes WHERE tree_id = ?")
            .bind(tree_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM trees WHERE id = ?")
            .bind(tree_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }
}

async fn upsert_node(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    tree_id: TreeId,
    node: &Node,
) -> Result<(), RepositoryError> {
    let children = serde_json::to_string(&node.children)?;
    let result = sqlx::query(
        "INSERT INTO nodes (id, tree_id, parent_id, depth, title, duration_secs, storage_key, status, children)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET
             title = excluded.title,
             duration_secs = excluded.duration_secs,
             storage_key = excluded.storage_key,
             status = excluded.status,
             children = excluded.children
         WHERE nodes.tree_id = excluded.tree_id",
    )
    .bind(node.id)
    .bind(tree_id)
    .bind(node.parent_id)
    .bind(i64::from(node.depth))
    .bind(&node.info.title)
    .bind(node.info.duration_secs)
    .bind(&node.info.storage_key)
    .bind(node.info.status.as_str())
    .bind(children)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(TreeError::ConflictingTopology(format!(
            "node `{}` belongs to another tree",
            node.id
        ))
        .into());
    }
    Ok(())
}
