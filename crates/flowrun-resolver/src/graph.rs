use std::collections::{HashMap, HashSet, VecDeque};

use flowrun_config::DagTask;

use crate::error::ResolverError;

/// Dependency graph of the tasks of a dag.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Adjacency list: task_id -> list of dependent task_ids.
  adjacency: HashMap<String, Vec<String>>,
  /// Reverse adjacency: task_id -> list of dependencies.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Tasks without dependencies, in declaration order.
  entry_points: Vec<String>,
}

impl Graph {
  /// Build and check the graph of the dag task `task_id`.
  ///
  /// Fails when a dependency names a task outside the dag, or when the
  /// dependencies form a cycle.
  pub fn new(task_id: &str, tasks: &[DagTask]) -> Result<Self, ResolverError> {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for dag_task in tasks {
      adjacency.entry(dag_task.task.id.clone()).or_default();
      reverse_adjacency.entry(dag_task.task.id.clone()).or_default();
    }

    for dag_task in tasks {
      for dependency in &dag_task.depends_on {
        if !adjacency.contains_key(dependency) {
          return Err(ResolverError::UnknownDependency {
            task_id: dag_task.task.id.clone(),
            dependency: dependency.clone(),
          });
        }
        adjacency
          .entry(dependency.clone())
          .or_default()
          .push(dag_task.task.id.clone());
        reverse_adjacency
          .entry(dag_task.task.id.clone())
          .or_default()
          .push(dependency.clone());
      }
    }

    let entry_points: Vec<String> = tasks
      .iter()
      .map(|dag_task| dag_task.task.id.clone())
      .filter(|id| reverse_adjacency.get(id).is_none_or(|v| v.is_empty()))
      .collect();

    let graph = Self {
      adjacency,
      reverse_adjacency,
      entry_points,
    };
    graph.check_acyclic(task_id)?;

    Ok(graph)
  }

  /// Kahn's algorithm: whatever can't be reached from the entry points sits
  /// on a cycle.
  fn check_acyclic(&self, task_id: &str) -> Result<(), ResolverError> {
    let mut in_degree: HashMap<&str, usize> = self
      .reverse_adjacency
      .iter()
      .map(|(id, upstream)| (id.as_str(), upstream.len()))
      .collect();
    let mut queue: VecDeque<&str> = self.entry_points.iter().map(String::as_str).collect();
    let mut visited: HashSet<&str> = HashSet::new();

    while let Some(id) = queue.pop_front() {
      visited.insert(id);
      for next in self.downstream(id) {
        if let Some(degree) = in_degree.get_mut(next.as_str()) {
          *degree -= 1;
          if *degree == 0 {
            queue.push_back(next.as_str());
          }
        }
      }
    }

    if visited.len() == self.adjacency.len() {
      return Ok(());
    }

    let mut tasks: Vec<String> = self
      .adjacency
      .keys()
      .filter(|id| !visited.contains(id.as_str()))
      .cloned()
      .collect();
    tasks.sort();

    Err(ResolverError::Cycle {
      task_id: task_id.to_string(),
      tasks,
    })
  }

  /// Get entry points (tasks without dependencies).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// Get the tasks depending on `task_id`.
  pub fn downstream(&self, task_id: &str) -> &[String] {
    self
      .adjacency
      .get(task_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get the dependencies of `task_id`.
  pub fn upstream(&self, task_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(task_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }
}
