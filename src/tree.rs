use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    InProgress,
    Completed,
}

#[derive(Debug)]
struct Node {
    id: String,
    query: String,
    depth: u32,
    status: NodeStatus,
    learnings: Vec<String>,
    parent: Option<usize>,
}

/// Serializable view of one research branch.
#[derive(Debug, Clone, Serialize)]
pub struct TreeSnapshot {
    pub query: String,
    pub id: String,
    pub status: NodeStatus,
    pub depth: u32,
    pub learnings: Vec<String>,
    pub sub_queries: Vec<TreeSnapshot>,
    pub parent_query: Option<String>,
}

/// In-memory record of every query issued during one research run.
///
/// Nodes live in an arena and are identified by their index; the query-text
/// map is only a lookup for idempotent registration. A query text therefore
/// maps to exactly one node for the whole run, and the parent edge recorded
/// at first sight wins.
#[derive(Debug, Default)]
pub struct ProgressTree {
    nodes: Vec<Node>,
    by_query: HashMap<String, usize>,
    root: Option<usize>,
}

impl ProgressTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query. No-op if the text was already registered; the first
    /// registration assigns the node id and the parent edge.
    pub fn start(&mut self, query: &str, depth: u32, parent: Option<&str>) {
        if self.by_query.contains_key(query) {
            return;
        }
        let parent_idx = parent.and_then(|p| self.by_query.get(p).copied());
        let idx = self.nodes.len();
        self.nodes.push(Node {
            id: Uuid::new_v4().to_string(),
            query: query.to_string(),
            depth,
            status: NodeStatus::InProgress,
            learnings: Vec::new(),
            parent: parent_idx,
        });
        self.by_query.insert(query.to_string(), idx);
        if parent_idx.is_none() && self.root.is_none() {
            self.root = Some(idx);
        }
    }

    /// Append a learning to the node's set. Duplicate text is rejected;
    /// insertion order is preserved. Returns whether the learning was new.
    pub fn add_learning(&mut self, query: &str, learning: &str) -> bool {
        let Some(&idx) = self.by_query.get(query) else {
            return false;
        };
        let node = &mut self.nodes[idx];
        if node.learnings.iter().any(|l| l == learning) {
            return false;
        }
        node.learnings.push(learning.to_string());
        true
    }

    /// Mark a query completed, then cascade upward: each ancestor is
    /// completed once every one of its children is completed. Idempotent
    /// and correct regardless of the order branches finish in.
    pub fn complete(&mut self, query: &str) {
        let Some(&idx) = self.by_query.get(query) else {
            return;
        };
        if self.nodes[idx].status == NodeStatus::Completed {
            return;
        }
        self.nodes[idx].status = NodeStatus::Completed;

        let mut parent = self.nodes[idx].parent;
        while let Some(p) = parent {
            if self.nodes[p].status == NodeStatus::Completed {
                break;
            }
            let all_children_done = self
                .nodes
                .iter()
                .filter(|n| n.parent == Some(p))
                .all(|n| n.status == NodeStatus::Completed);
            if !all_children_done {
                break;
            }
            self.nodes[p].status = NodeStatus::Completed;
            parent = self.nodes[p].parent;
        }
    }

    pub fn total(&self) -> usize {
        self.nodes.len()
    }

    pub fn completed(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Completed)
            .count()
    }

    pub fn is_completed(&self, query: &str) -> bool {
        self.by_query
            .get(query)
            .map(|&idx| self.nodes[idx].status == NodeStatus::Completed)
            .unwrap_or(false)
    }

    pub fn learnings_of(&self, query: &str) -> Vec<String> {
        self.by_query
            .get(query)
            .map(|&idx| self.nodes[idx].learnings.clone())
            .unwrap_or_default()
    }

    /// Immutable tree view rooted at the run's root query.
    pub fn snapshot(&self) -> Option<TreeSnapshot> {
        self.root.map(|root| self.build_snapshot(root))
    }

    fn build_snapshot(&self, idx: usize) -> TreeSnapshot {
        let node = &self.nodes[idx];
        let sub_queries = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent == Some(idx))
            .map(|(child, _)| self.build_snapshot(child))
            .collect();
        TreeSnapshot {
            query: node.query.clone(),
            id: node.id.clone(),
            status: node.status,
            depth: node.depth,
            learnings: node.learnings.clone(),
            sub_queries,
            parent_query: node.parent.map(|p| self.nodes[p].query.clone()),
        }
    }
}
