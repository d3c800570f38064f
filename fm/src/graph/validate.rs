//! Graph validation
//!
//! Structural checks used after PM-driven mutations and by the test suite:
//! dangling dependency references, dependency cycles, and the
//! readiness/pending status invariants.

use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;

use crate::domain::TaskStatus;

use super::TaskGraph;

/// A structural defect in a task graph
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("task {task} depends on missing task {dep}")]
    DanglingDependency { task: String, dep: String },

    #[error("dependency cycle involving tasks: {0:?}")]
    Cycle(Vec<String>),

    #[error("task {task} is ready but dependency {dep} is not terminal")]
    PrematureReady { task: String, dep: String },

    #[error("task {task} is pending but all dependencies are terminal")]
    StalePending { task: String },
}

/// Topologically sort the graph, or report the tasks stuck in a cycle
pub fn topological_sort(graph: &TaskGraph) -> Result<Vec<String>, GraphError> {
    let mut indegree: BTreeMap<&str, usize> = graph.tasks().map(|n| (n.id.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for node in graph.tasks() {
        for dep in &node.depends_on {
            if !indegree.contains_key(dep.as_str()) {
                return Err(GraphError::DanglingDependency {
                    task: node.id.clone(),
                    dep: dep.clone(),
                });
            }
            *indegree.get_mut(node.id.as_str()).unwrap() += 1;
            dependents.entry(dep.as_str()).or_default().push(node.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(indegree.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            let d = indegree.get_mut(dependent).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() < indegree.len() {
        let in_order: std::collections::BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let cyclic: Vec<String> = indegree
            .keys()
            .filter(|id| !in_order.contains(**id))
            .map(|id| id.to_string())
            .collect();
        return Err(GraphError::Cycle(cyclic));
    }

    Ok(order)
}

/// Check every structural invariant the engine relies on
pub fn check(graph: &TaskGraph) -> Result<(), GraphError> {
    topological_sort(graph)?;

    for node in graph.tasks() {
        let open_dep = node.depends_on.iter().find(|dep| {
            graph
                .get(dep)
                .map(|d| !d.status.is_terminal())
                .unwrap_or(true)
        });

        match node.status {
            TaskStatus::Ready => {
                if let Some(dep) = open_dep {
                    return Err(GraphError::PrematureReady {
                        task: node.id.clone(),
                        dep: dep.clone(),
                    });
                }
            }
            TaskStatus::Pending => {
                if open_dep.is_none() {
                    return Err(GraphError::StalePending { task: node.id.clone() });
                }
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskNode, TaskSpec};

    fn spec(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            id: Some(id.to_string()),
            title: id.to_string(),
            description: String::new(),
            acceptance: vec![],
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            agent: "coder".to_string(),
            role: None,
            provider: None,
            model: None,
            skills: vec![],
        }
    }

    #[test]
    fn test_topological_sort_linear() {
        let (graph, _) = TaskGraph::default().add_tasks(
            vec![spec("t1", &[]), spec("t2", &["t1"]), spec("t3", &["t2"])],
            0,
        );
        let order = topological_sort(&graph).unwrap();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("t1") < pos("t2"));
        assert!(pos("t2") < pos("t3"));
    }

    #[test]
    fn test_cycle_detected() {
        let mut a = TaskNode::from_spec("t1".to_string(), spec("t1", &["t2"]), TaskStatus::Pending, 0);
        a.depends_on = vec!["t2".to_string()];
        let b = TaskNode::from_spec("t2".to_string(), spec("t2", &["t1"]), TaskStatus::Pending, 0);
        let graph = TaskGraph::from_nodes([a, b]);

        match topological_sort(&graph) {
            Err(GraphError::Cycle(ids)) => {
                assert!(ids.contains(&"t1".to_string()));
                assert!(ids.contains(&"t2".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_dangling_dependency() {
        let node = TaskNode::from_spec("t1".to_string(), spec("t1", &["t9"]), TaskStatus::Pending, 0);
        let graph = TaskGraph::from_nodes([node]);
        assert!(matches!(
            topological_sort(&graph),
            Err(GraphError::DanglingDependency { .. })
        ));
    }

    #[test]
    fn test_check_accepts_engine_transitions() {
        let (graph, _) = TaskGraph::default().add_tasks(
            vec![spec("t1", &[]), spec("t2", &["t1"])],
            0,
        );
        check(&graph).unwrap();

        let graph = graph.update_status("t1", TaskStatus::Done);
        check(&graph).unwrap();
    }

    #[test]
    fn test_check_rejects_premature_ready() {
        let a = TaskNode::from_spec("t1".to_string(), spec("t1", &[]), TaskStatus::Running, 0);
        let b = TaskNode::from_spec("t2".to_string(), spec("t2", &["t1"]), TaskStatus::Ready, 0);
        let graph = TaskGraph::from_nodes([a, b]);
        assert!(matches!(check(&graph), Err(GraphError::PrematureReady { .. })));
    }
}
