//! Task graph parsing and validation.
//!
//! Graphs are loaded from JSON, validated (unique ids, resolvable acyclic
//! dependencies, level ordering, file-ownership rules), and then queried by
//! the scheduler for ready tasks. Validation failures carry enough context
//! to name the offending tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::steps::StepSpec;

/// Errors from graph parsing and validation.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to read task graph at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task graph JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("task graph must contain at least one task")]
    NoTasks,

    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),

    #[error("task {task:?} depends on itself")]
    SelfDependency { task: String },

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("task {0:?} has level 0; levels start at 1")]
    InvalidLevel(String),

    #[error(
        "task {task:?} (level {task_level}) depends on {dependency:?} (level {dependency_level}); dependencies must sit at a lower level"
    )]
    LevelOrdering {
        task: String,
        task_level: u32,
        dependency: String,
        dependency_level: u32,
    },

    #[error("dependency cycle detected involving tasks: {}", cycle.join(", "))]
    GraphCycle { cycle: Vec<String> },

    #[error(
        "ownership conflict on {file:?}: tasks {} both declare {kind}{}",
        tasks.join(", "),
        level.map(|l| format!(" at level {l}")).unwrap_or_default()
    )]
    OwnershipConflict {
        file: String,
        tasks: Vec<String>,
        kind: &'static str,
        level: Option<u32>,
    },
}

/// File-intent sets for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFiles {
    pub create: Vec<String>,
    pub modify: Vec<String>,
    pub read: Vec<String>,
}

/// Verification command for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSpec {
    pub command: String,
    #[serde(default = "default_verification_timeout")]
    pub timeout_seconds: u64,
}

fn default_verification_timeout() -> u64 {
    60
}

/// One task as declared in the graph document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub level: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: TaskFiles,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub verification: VerificationSpec,
    #[serde(default)]
    pub estimate_minutes: Option<u32>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// The raw graph document shape.
#[derive(Debug, Clone, Deserialize)]
struct GraphDoc {
    tasks: Vec<TaskSpec>,
    #[serde(default)]
    max_parallelization: Option<u32>,
}

/// A validated, queryable task graph.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<TaskSpec>,
    index: HashMap<String, usize>,
    max_parallelization: Option<u32>,
}

impl TaskGraph {
    /// Parse and validate a graph from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let doc: GraphDoc = serde_json::from_str(json)?;
        Self::from_tasks(doc.tasks, doc.max_parallelization)
    }

    /// Parse and validate a graph from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, GraphError> {
        let doc: GraphDoc = serde_json::from_value(value)?;
        Self::from_tasks(doc.tasks, doc.max_parallelization)
    }

    /// Load and validate a graph from a file.
    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let json = std::fs::read_to_string(path).map_err(|source| GraphError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    fn from_tasks(
        tasks: Vec<TaskSpec>,
        max_parallelization: Option<u32>,
    ) -> Result<Self, GraphError> {
        if tasks.is_empty() {
            return Err(GraphError::NoTasks);
        }

        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTaskId(task.id.clone()));
            }
        }

        let graph = Self {
            tasks,
            index,
            max_parallelization,
        };
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<(), GraphError> {
        for task in &self.tasks {
            if task.level == 0 {
                return Err(GraphError::InvalidLevel(task.id.clone()));
            }
            for dep in &task.dependencies {
                if dep == &task.id {
                    return Err(GraphError::SelfDependency {
                        task: task.id.clone(),
                    });
                }
                if !self.index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Cycles before level ordering: a cyclic graph always violates the
        // level rule too, and the cycle is the more useful diagnosis.
        self.check_cycles()?;

        for task in &self.tasks {
            for dep in &task.dependencies {
                let dep_level = self.tasks[self.index[dep.as_str()]].level;
                if dep_level >= task.level {
                    return Err(GraphError::LevelOrdering {
                        task: task.id.clone(),
                        task_level: task.level,
                        dependency: dep.clone(),
                        dependency_level: dep_level,
                    });
                }
            }
        }

        self.check_file_ownership()?;
        Ok(())
    }

    /// Kahn's algorithm. With level ordering already enforced a cycle cannot
    /// actually form, but the check stays independent so a relaxation of the
    /// level rule cannot silently admit one.
    fn check_cycles(&self) -> Result<(), GraphError> {
        let n = self.tasks.len();
        let mut in_degree = vec![0usize; n];
        let mut adjacent: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (task_idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                let dep_idx = self.index[dep.as_str()];
                adjacent[dep_idx].push(task_idx);
                in_degree[task_idx] += 1;
            }
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut sorted = 0usize;
        while let Some(node) = queue.pop_front() {
            sorted += 1;
            for &next in &adjacent[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if sorted != n {
            let cycle: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| self.tasks[i].id.clone())
                .collect();
            return Err(GraphError::GraphCycle { cycle });
        }
        Ok(())
    }

    /// At most one `create` owner per file anywhere; at most one `modify`
    /// owner per file within a level. Same-file modification at different
    /// levels is allowed (serialized by level ordering).
    fn check_file_ownership(&self) -> Result<(), GraphError> {
        let mut creators: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut modifiers: HashMap<(u32, &str), Vec<&str>> = HashMap::new();

        for task in &self.tasks {
            for file in &task.files.create {
                creators.entry(file).or_default().push(&task.id);
            }
            for file in &task.files.modify {
                modifiers
                    .entry((task.level, file))
                    .or_default()
                    .push(&task.id);
            }
        }

        for (file, tasks) in creators {
            if tasks.len() > 1 {
                return Err(GraphError::OwnershipConflict {
                    file: file.to_owned(),
                    tasks: tasks.iter().map(|t| (*t).to_owned()).collect(),
                    kind: "create",
                    level: None,
                });
            }
        }
        for ((level, file), tasks) in modifiers {
            if tasks.len() > 1 {
                return Err(GraphError::OwnershipConflict {
                    file: file.to_owned(),
                    tasks: tasks.iter().map(|t| (*t).to_owned()).collect(),
                    kind: "modify",
                    level: Some(level),
                });
            }
        }
        Ok(())
    }

    /// All tasks in declaration order.
    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Declared parallelization cap, if any.
    pub fn max_parallelization(&self) -> Option<u32> {
        self.max_parallelization
    }

    /// Tasks whose dependencies are all in `completed`. The caller filters
    /// by live status; the graph only knows the static structure.
    pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<&TaskSpec> {
        self.tasks
            .iter()
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
            .collect()
    }

    /// All tasks at a level, in declaration order.
    pub fn level_tasks(&self, level: u32) -> Vec<&TaskSpec> {
        self.tasks.iter().filter(|t| t.level == level).collect()
    }

    /// Number of distinct levels.
    pub fn level_count(&self) -> usize {
        self.tasks
            .iter()
            .map(|t| t.level)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Highest declared level.
    pub fn max_level(&self) -> u32 {
        self.tasks.iter().map(|t| t.level).max().unwrap_or(0)
    }

    /// Sorted distinct level numbers.
    pub fn levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = self
            .tasks
            .iter()
            .map(|t| t.level)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        levels.sort_unstable();
        levels
    }

    /// Longest path by `estimate_minutes` through the dependency DAG,
    /// computed with a topological DP. Reporting only; tasks without an
    /// estimate count as zero.
    pub fn critical_path(&self) -> (u32, Vec<String>) {
        let n = self.tasks.len();
        // Process in level order; dependencies always sit at lower levels.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| self.tasks[i].level);

        let mut best: Vec<u32> = vec![0; n];
        let mut prev: Vec<Option<usize>> = vec![None; n];

        for &i in &order {
            let own = self.tasks[i].estimate_minutes.unwrap_or(0);
            let mut incoming = 0;
            for dep in &self.tasks[i].dependencies {
                let dep_idx = self.index[dep.as_str()];
                if best[dep_idx] > incoming {
                    incoming = best[dep_idx];
                    prev[i] = Some(dep_idx);
                }
            }
            best[i] = incoming + own;
        }

        let Some((mut at, &total)) = best
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
        else {
            return (0, Vec::new());
        };

        let mut path = vec![self.tasks[at].id.clone()];
        while let Some(p) = prev[at] {
            path.push(self.tasks[p].id.clone());
            at = p;
        }
        path.reverse();
        (total, path)
    }

    /// Sum of all task estimates, in minutes.
    pub fn total_estimate_minutes(&self) -> u32 {
        self.tasks
            .iter()
            .filter_map(|t| t.estimate_minutes)
            .sum()
    }
}
