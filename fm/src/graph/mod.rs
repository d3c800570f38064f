//! Task graph engine
//!
//! Pure transitions over an immutable [`TaskGraph`]. Every mutating
//! operation returns a new graph; no I/O happens here. Tasks are keyed in a
//! `BTreeMap` so all public iteration and every auto-promotion scan is
//! deterministic and lexicographic by id.

pub mod validate;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::{TaskChanges, TaskNode, TaskSpec, TaskStatus};

/// Optional fields written together with a status transition
#[derive(Debug, Clone, Default)]
pub struct StatusFields {
    pub output: Option<String>,
    pub error: Option<String>,
    /// Added to the node's accumulated cost
    pub cost_delta: f64,
    /// Added to the node's attempt counter
    pub attempts_delta: u32,
}

/// The dependency graph of work items for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskGraph {
    tasks: BTreeMap<String, TaskNode>,
}

impl TaskGraph {
    /// Build a graph from nodes
    pub fn from_nodes(nodes: impl IntoIterator<Item = TaskNode>) -> Self {
        Self {
            tasks: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Nodes in lexicographic id order
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.tasks.values()
    }

    /// Ids of nodes with the given status, in lexicographic order
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .values()
            .filter(|n| n.status == status)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Whether every dependency of the node is terminal
    fn deps_terminal(&self, node: &TaskNode) -> bool {
        node.depends_on
            .iter()
            .all(|dep| self.tasks.get(dep).map(|d| d.status.is_terminal()).unwrap_or(false))
    }

    /// Tasks eligible for launch: `ready` nodes plus `pending` nodes whose
    /// dependencies are all terminal
    pub fn ready_tasks(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|n| match n.status {
                TaskStatus::Ready => true,
                TaskStatus::Pending => self.deps_terminal(n),
                _ => false,
            })
            .map(|n| n.id.clone())
            .collect()
    }

    /// Promote `pending` nodes whose dependencies became terminal
    fn promoted(mut self) -> Self {
        let promote: Vec<String> = self
            .tasks
            .values()
            .filter(|n| n.status == TaskStatus::Pending && self.deps_terminal(n))
            .map(|n| n.id.clone())
            .collect();
        for id in promote {
            if let Some(node) = self.tasks.get_mut(&id) {
                node.status = TaskStatus::Ready;
            }
        }
        self
    }

    /// Write a status to a node; a terminal status triggers an
    /// auto-promotion scan over the whole graph
    pub fn update_status(&self, id: &str, status: TaskStatus) -> Self {
        self.update_status_with(id, status, StatusFields::default())
    }

    /// Write a status and optional fields to a node
    pub fn update_status_with(&self, id: &str, status: TaskStatus, fields: StatusFields) -> Self {
        let mut next = self.clone();
        let Some(node) = next.tasks.get_mut(id) else {
            return next;
        };

        node.status = status;
        if let Some(output) = fields.output {
            node.output = Some(output);
        }
        if let Some(error) = fields.error {
            node.error = Some(error);
        }
        node.cost_usd += fields.cost_delta;
        node.attempts += fields.attempts_delta;

        if status.is_terminal() { next.promoted() } else { next }
    }

    /// Insert new task specs. Readiness is evaluated against the pre-insert
    /// graph, so a spec depending on a sibling in the same batch starts
    /// `pending` and is promoted on a later transition. Returns the new
    /// graph and the assigned ids in insertion order. Dependency references
    /// that name neither an existing task nor a batch sibling are dropped.
    pub fn add_tasks(&self, specs: Vec<TaskSpec>, round: u32) -> (Self, Vec<String>) {
        let mut next = self.clone();
        let mut added = Vec::with_capacity(specs.len());

        // Ids that may legally be referenced by the batch
        let mut known: BTreeSet<String> = self.tasks.keys().cloned().collect();
        let mut batch_ids: Vec<String> = Vec::with_capacity(specs.len());
        let mut assigned: Vec<(String, TaskSpec)> = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = match &spec.id {
                Some(id) if !id.is_empty() && !known.contains(id) => id.clone(),
                _ => Self::next_id_after(&known),
            };
            known.insert(id.clone());
            batch_ids.push(id.clone());
            assigned.push((id, spec));
        }

        for (id, mut spec) in assigned {
            spec.depends_on.retain(|dep| known.contains(dep));

            // Pre-insert readiness: only deps that already exist count
            let all_terminal = spec.depends_on.iter().all(|dep| {
                self.tasks.get(dep).map(|d| d.status.is_terminal()).unwrap_or(false)
            });
            let status = if spec.depends_on.is_empty() || all_terminal {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            };

            let node = TaskNode::from_spec(id.clone(), spec, status, round);
            next.tasks.insert(id.clone(), node);
            added.push(id);
        }

        (next, added)
    }

    /// Cancel the given tasks and promote downstream nodes whose remaining
    /// non-terminal dependencies were exactly those tasks
    pub fn remove_tasks(&self, ids: &[String]) -> Self {
        let mut next = self.clone();
        for id in ids {
            if let Some(node) = next.tasks.get_mut(id) {
                node.status = TaskStatus::Cancelled;
            }
        }
        next.promoted()
    }

    /// Mark the given tasks skipped and promote downstream nodes
    pub fn skip_tasks(&self, ids: &[String]) -> Self {
        let mut next = self.clone();
        for id in ids {
            if let Some(node) = next.tasks.get_mut(id) {
                node.status = TaskStatus::Skipped;
            }
        }
        next.promoted()
    }

    /// Change agent/role assignment without changing status
    pub fn reassign(&self, id: &str, agent: &str, role: Option<&str>) -> Self {
        let mut next = self.clone();
        if let Some(node) = next.tasks.get_mut(id) {
            node.agent = agent.to_string();
            node.role = role.map(str::to_string);
        }
        next
    }

    /// Block a task on a question
    pub fn block(&self, id: &str, question: &str) -> Self {
        let mut next = self.clone();
        if let Some(node) = next.tasks.get_mut(id) {
            node.status = TaskStatus::Blocked;
            node.blocking_question = Some(question.to_string());
        }
        next
    }

    /// Unblock a task: back to `ready` if its dependencies are terminal,
    /// otherwise `pending`
    pub fn unblock(&self, id: &str) -> Self {
        let mut next = self.clone();
        let status = match next.tasks.get(id) {
            Some(node) if next.deps_terminal(node) => TaskStatus::Ready,
            Some(_) => TaskStatus::Pending,
            None => return next,
        };
        if let Some(node) = next.tasks.get_mut(id) {
            node.status = status;
            node.blocking_question = None;
        }
        next
    }

    /// Reset a failed task to `ready`, increment attempts, clear the error,
    /// and apply any overrides
    pub fn retry(&self, id: &str, changes: Option<&TaskChanges>) -> Self {
        let mut next = self.clone();
        if let Some(node) = next.tasks.get_mut(id) {
            node.status = TaskStatus::Ready;
            node.attempts += 1;
            node.error = None;
            if let Some(changes) = changes {
                if let Some(description) = &changes.description {
                    node.description = description.clone();
                }
                if let Some(agent) = &changes.agent {
                    node.agent = agent.clone();
                }
                if let Some(role) = &changes.role {
                    node.role = Some(role.clone());
                }
            }
        }
        next
    }

    /// All nodes are settled (done, failed, skipped, or cancelled)
    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(|n| n.status.is_settled())
    }

    /// Nothing running or ready, but pending or blocked work exists
    pub fn is_stuck(&self) -> bool {
        let mut has_open = false;
        for node in self.tasks.values() {
            match node.status {
                TaskStatus::Running | TaskStatus::Ready => return false,
                TaskStatus::Pending | TaskStatus::Blocked => has_open = true,
                _ => {}
            }
        }
        has_open
    }

    /// Next identifier following the `t<N>` convention
    pub fn next_task_id(&self) -> String {
        Self::next_id_after(&self.tasks.keys().cloned().collect())
    }

    fn next_id_after(known: &BTreeSet<String>) -> String {
        let max = known
            .iter()
            .filter_map(|id| id.strip_prefix('t').and_then(|n| n.parse::<u64>().ok()))
            .max()
            .unwrap_or(0);
        format!("t{}", max + 1)
    }
}
