//! Represents a video tree: a branching arrangement of playable segments.
//!
//! Nodes live in an arena keyed by id. Parent and child links are stored as
//! ids, never as owning pointers, so a tree can be loaded and saved node by
//! node. The root node shares its id with the tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use uuid::Uuid;

pub type TreeId = Uuid;
pub type NodeId = Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("tree `{0}` not found")]
    TreeNotFound(TreeId),
    #[error("node `{node}` not found in tree `{tree}`")]
    NodeNotFound { tree: TreeId, node: NodeId },
    #[error("conflicting topology: {0}")]
    ConflictingTopology(String),
}

/// Editing/publication status of a segment.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Editing,
    Published,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Editing => "editing",
            NodeStatus::Published => "published",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "editing" => Some(NodeStatus::Editing),
            "published" => Some(NodeStatus::Published),
            _ => None,
        }
    }
}

/// Segment metadata carried by a node.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub title: String,

    /// Playback length in seconds, known once the client has probed the file.
    #[serde(default)]
    pub duration_secs: f64,

    /// Object key of the uploaded segment. Set only after upload completion.
    #[serde(default)]
    pub storage_key: Option<String>,

    #[serde(default)]
    pub status: NodeStatus,
}

impl NodeInfo {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// One segment / branch point of a video tree.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,

    /// Owning node. `None` only for the root.
    pub parent_id: Option<NodeId>,

    /// Distance from the root (root = 0).
    pub depth: u32,

    pub info: NodeInfo,

    /// Child ids in branch order (first inserted = first child).
    pub children: Vec<NodeId>,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A whole video tree, exclusively owning its node arena.
#[derive(Clone, Debug)]
pub struct VideoTree {
    pub id: TreeId,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    nodes: HashMap<NodeId, Node>,
}

impl VideoTree {
    /// Allocate a fresh tree with a single empty root at depth 0.
    pub fn new(owner_id: Uuid, title: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let root = Node {
            id,
            parent_id: None,
            depth: 0,
            info: NodeInfo::titled(title),
            children: Vec::new(),
        };

        let mut nodes = HashMap::new();
        nodes.insert(id, root);

        Self {
            id,
            owner_id,
            created_at: Utc::now(),
            nodes,
        }
    }

    /// Rebuild a tree from persisted nodes, rejecting any broken topology.
    ///
    /// Checks: exactly one root whose id is the tree id, every parent link
    /// resolves, parent and child lists agree, depths increase by one per
    /// level and every node is reachable from the root.
    pub fn from_nodes(
        id: TreeId,
        owner_id: Uuid,
        created_at: DateTime<Utc>,
        nodes: Vec<Node>,
    ) -> Result<Self, TreeError> {
        let mut arena = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let node_id = node.id;
            if arena.insert(node_id, node).is_some() {
                return Err(conflict(format!("node `{node_id}` appears twice")));
            }
        }

        let roots: Vec<&Node> = arena.values().filter(|n| n.is_root()).collect();
        match roots.as_slice() {
            [root] if root.id == id => {}
            [root] => {
                return Err(conflict(format!(
                    "root `{}` does not match tree `{id}`",
                    root.id
                )));
            }
            [] => return Err(conflict("tree has no root".into())),
            _ => return Err(conflict("tree has more than one root".into())),
        }

        for node in arena.values() {
            if let Some(parent_id) = node.parent_id {
                let parent = arena.get(&parent_id).ok_or(TreeError::NodeNotFound {
                    tree: id,
                    node: parent_id,
                })?;
                let listed = parent.children.iter().filter(|c| **c == node.id).count();
                if listed != 1 {
                    return Err(conflict(format!(
                        "node `{}` listed {listed} times by parent `{parent_id}`",
                        node.id
                    )));
                }
                if node.depth != parent.depth + 1 {
                    return Err(conflict(format!(
                        "node `{}` has depth {} under parent at depth {}",
                        node.id, node.depth, parent.depth
                    )));
                }
            }

            for child_id in &node.children {
                match arena.get(child_id) {
                    Some(child) if child.parent_id == Some(node.id) => {}
                    Some(_) => {
                        return Err(conflict(format!(
                            "node `{child_id}` is listed by `{}` but has another parent",
                            node.id
                        )));
                    }
                    None => {
                        return Err(TreeError::NodeNotFound {
                            tree: id,
                            node: *child_id,
                        });
                    }
                }
            }
        }

        let tree = Self {
            id,
            owner_id,
            created_at,
            nodes: arena,
        };

        let mut seen = HashSet::with_capacity(tree.nodes.len());
        for node in tree.traverse() {
            if !seen.insert(node.id) {
                return Err(conflict(format!("node `{}` is reachable twice", node.id)));
            }
        }
        if seen.len() != tree.nodes.len() {
            return Err(conflict("tree contains nodes unreachable from the root".into()));
        }

        Ok(tree)
    }

    pub fn root(&self) -> &Node {
        // The root is inserted at construction and can never be removed.
        &self.nodes[&self.id]
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Append a new branch under `parent_id` and return it.
    pub fn add_child(&mut self, parent_id: NodeId, info: NodeInfo) -> Result<&Node, TreeError> {
        let tree = self.id;
        let parent = self
            .nodes
            .get_mut(&parent_id)
            .ok_or(TreeError::NodeNotFound {
                tree,
                node: parent_id,
            })?;

        let child = Node {
            id: Uuid::new_v4(),
            parent_id: Some(parent_id),
            depth: parent.depth + 1,
            info,
            children: Vec::new(),
        };
        parent.children.push(child.id);

        let child_id = child.id;
        self.nodes.insert(child_id, child);
        Ok(&self.nodes[&child_id])
    }

    /// Record the object key of a completed upload on a node.
    pub fn attach_storage_key(
        &mut self,
        node_id: NodeId,
        storage_key: impl Into<String>,
    ) -> Result<&Node, TreeError> {
        let tree = self.id;
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(TreeError::NodeNotFound {
                tree,
                node: node_id,
            })?;
        node.info.storage_key = Some(storage_key.into());
        Ok(&*node)
    }

    /// Breadth-first walk from the root, children in branch order.
    ///
    /// Lazy and restartable: every call starts a new walk.
    pub fn traverse(&self) -> Traverse<'_> {
        Traverse {
            tree: self,
            queue: VecDeque::from([self.id]),
        }
    }

    /// Object keys referenced by node payloads, in traversal order.
    pub fn storage_keys(&self) -> Vec<String> {
        self.traverse()
            .filter_map(|node| node.info.storage_key.clone())
            .collect()
    }
}

/// Breadth-first iterator over a [`VideoTree`].
pub struct Traverse<'a> {
    tree: &'a VideoTree,
    queue: VecDeque<NodeId>,
}

impl<'a> Iterator for Traverse<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node_id = self.queue.pop_front()?;
        let node = self.tree.nodes.get(&node_id)?;
        self.queue.extend(node.children.iter().copied());
        Some(node)
    }
}

fn conflict(reason: String) -> TreeError {
    TreeError::ConflictingTopology(reason)
}
