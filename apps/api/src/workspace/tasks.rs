//! Task Graph Model — named units of build work, their dependencies and status.
//!
//! Per-task state machine:
//!
//! ```text
//! pending ──► running ──► completed
//!    │           │
//!    │           └──────► failed ──► running   (only after a retry command)
//!    ├──► completed / failed                   (fast-forward, never started)
//!    └──► skipped
//! ```
//!
//! Tasks never move on their own. Every transition is driven by a build event, and
//! a transition the machine does not allow is reported back instead of applied.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Message recorded for a failed task whose payload carried none.
const DEFAULT_FAILURE_MESSAGE: &str = "Task failed";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    fn can_move_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running | Completed | Failed | Skipped)
                | (Running, Completed | Failed)
                | (Failed, Running)
        )
    }
}

/// One unit of work produced by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: String,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Paths this task wrote. Weak references: later writes by other tasks don't matter.
    #[serde(default)]
    pub output_files: Vec<String>,
    /// Present if and only if `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
impl BuildTask {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: String::new(),
            name: name.into(),
            description: String::new(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            output_files: Vec::new(),
            error: None,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Outcome of asking the graph to move a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Duplicate delivery: the task was already in the target state.
    Unchanged,
    Rejected {
        from: TaskStatus,
        to: TaskStatus,
    },
    UnknownTask,
}

/// Per-status counts, derived on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub percent: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskGraph {
    tasks: Vec<BuildTask>,
}

impl TaskGraph {
    /// Builds a graph from a planner snapshot, repairing what would break invariants:
    /// duplicate ids (first wins), dependencies outside the snapshot, self-dependencies,
    /// and `error` fields that disagree with `status`.
    pub fn from_tasks(tasks: Vec<BuildTask>) -> Self {
        let mut seen = HashSet::new();
        let mut unique: Vec<BuildTask> = Vec::with_capacity(tasks.len());
        for task in tasks {
            if seen.insert(task.id.clone()) {
                unique.push(task);
            } else {
                warn!("Dropping duplicate task id '{}' from plan", task.id);
            }
        }

        for task in &mut unique {
            let own_id = task.id.clone();
            let mut kept = HashSet::new();
            task.depends_on.retain(|dep| {
                let valid = dep != &own_id && seen.contains(dep);
                if !valid {
                    warn!("Task '{own_id}' depends on unknown task '{dep}'; dropping edge");
                }
                valid && kept.insert(dep.clone())
            });

            match task.status {
                TaskStatus::Failed => {
                    if task.error.is_none() {
                        task.error = Some(DEFAULT_FAILURE_MESSAGE.to_string());
                    }
                }
                _ => task.error = None,
            }
        }

        Self { tasks: unique }
    }

    pub fn tasks(&self) -> &[BuildTask] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&BuildTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn start(&mut self, id: &str) -> Transition {
        self.transition(id, TaskStatus::Running, None)
    }

    pub fn complete(&mut self, id: &str) -> Transition {
        self.transition(id, TaskStatus::Completed, None)
    }

    pub fn fail(&mut self, id: &str, message: &str) -> Transition {
        let message = if message.trim().is_empty() {
            DEFAULT_FAILURE_MESSAGE
        } else {
            message
        };
        self.transition(id, TaskStatus::Failed, Some(message.to_string()))
    }

    pub fn skip(&mut self, id: &str) -> Transition {
        self.transition(id, TaskStatus::Skipped, None)
    }

    fn transition(&mut self, id: &str, to: TaskStatus, error: Option<String>) -> Transition {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return Transition::UnknownTask;
        };
        let from = task.status;

        if from == to {
            // A repeated failure may carry a newer message.
            if to == TaskStatus::Failed && error.is_some() && task.error != error {
                task.error = error;
                return Transition::Applied;
            }
            return Transition::Unchanged;
        }
        if !from.can_move_to(to) {
            return Transition::Rejected { from, to };
        }

        task.status = to;
        task.error = error;
        Transition::Applied
    }

    /// `completed / total`, or 0 for an empty graph.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        self.count(TaskStatus::Completed) as f64 / self.tasks.len() as f64
    }

    pub fn summary(&self) -> ProgressSummary {
        let total = self.tasks.len();
        let completed = self.count(TaskStatus::Completed);
        ProgressSummary {
            total,
            pending: self.count(TaskStatus::Pending),
            running: self.count(TaskStatus::Running),
            completed,
            failed: self.count(TaskStatus::Failed),
            skipped: self.count(TaskStatus::Skipped),
            percent: if total == 0 {
                0
            } else {
                (completed * 100 / total) as u32
            },
        }
    }

    /// Pending tasks whose dependencies have all completed.
    pub fn ready_tasks(&self) -> Vec<&BuildTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on.iter().all(|dep| {
                    self.get(dep)
                        .is_some_and(|d| d.status == TaskStatus::Completed)
                })
            })
            .collect()
    }

    /// True when no task can make further progress without a retry.
    pub fn is_settled(&self) -> bool {
        self.tasks.iter().all(|t| {
            matches!(
                t.status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
            )
        })
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_graph() -> TaskGraph {
        TaskGraph::from_tasks(vec![
            BuildTask::new("t1", "Initialize Project"),
            BuildTask::new("t2", "Hero Section").depends_on(&["t1"]),
        ])
    }

    #[test]
    fn test_forward_path() {
        let mut graph = two_step_graph();
        assert_eq!(graph.start("t1"), Transition::Applied);
        assert_eq!(graph.complete("t1"), Transition::Applied);
        assert_eq!(graph.get("t1").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_complete_from_pending_fast_forwards() {
        let mut graph = two_step_graph();
        assert_eq!(graph.complete("t2"), Transition::Applied);
        assert_eq!(graph.get("t2").unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_failed_after_completed_is_rejected() {
        let mut graph = two_step_graph();
        graph.complete("t1");
        assert_eq!(
            graph.fail("t1", "late"),
            Transition::Rejected {
                from: TaskStatus::Completed,
                to: TaskStatus::Failed
            }
        );
        let task = graph.get("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_duplicate_completion_is_unchanged() {
        let mut graph = two_step_graph();
        graph.complete("t1");
        assert_eq!(graph.complete("t1"), Transition::Unchanged);
    }

    #[test]
    fn test_failed_task_restarts_and_clears_error() {
        let mut graph = two_step_graph();
        graph.start("t1");
        graph.fail("t1", "boom");
        assert_eq!(graph.get("t1").unwrap().error.as_deref(), Some("boom"));

        assert_eq!(graph.start("t1"), Transition::Applied);
        let task = graph.get("t1").unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_repeated_failure_updates_message() {
        let mut graph = two_step_graph();
        graph.fail("t1", "first");
        assert_eq!(graph.fail("t1", "first"), Transition::Unchanged);
        assert_eq!(graph.fail("t1", "second"), Transition::Applied);
        assert_eq!(graph.get("t1").unwrap().error.as_deref(), Some("second"));
    }

    #[test]
    fn test_blank_failure_message_gets_default() {
        let mut graph = two_step_graph();
        graph.fail("t1", "  ");
        assert_eq!(graph.get("t1").unwrap().error.as_deref(), Some("Task failed"));
    }

    #[test]
    fn test_skip_only_from_pending() {
        let mut graph = two_step_graph();
        assert_eq!(graph.skip("t2"), Transition::Applied);

        graph.start("t1");
        assert_eq!(
            graph.skip("t1"),
            Transition::Rejected {
                from: TaskStatus::Running,
                to: TaskStatus::Skipped
            }
        );
    }

    #[test]
    fn test_terminal_states_do_not_restart() {
        let mut graph = two_step_graph();
        graph.complete("t1");
        graph.skip("t2");
        assert!(matches!(graph.start("t1"), Transition::Rejected { .. }));
        assert!(matches!(graph.start("t2"), Transition::Rejected { .. }));
    }

    #[test]
    fn test_unknown_task_is_reported() {
        let mut graph = two_step_graph();
        assert_eq!(graph.start("ghost"), Transition::UnknownTask);
        assert_eq!(graph.fail("ghost", "x"), Transition::UnknownTask);
    }

    #[test]
    fn test_progress_of_empty_graph_is_zero() {
        let graph = TaskGraph::default();
        assert_eq!(graph.progress(), 0.0);
        assert!(!graph.progress().is_nan());
        assert_eq!(graph.summary().percent, 0);
    }

    #[test]
    fn test_progress_tracks_completed_share() {
        let mut graph = two_step_graph();
        graph.complete("t1");
        assert_eq!(graph.progress(), 0.5);
        graph.complete("t2");
        assert_eq!(graph.progress(), 1.0);
    }

    #[test]
    fn test_summary_counts() {
        let mut graph = TaskGraph::from_tasks(vec![
            BuildTask::new("a", "A"),
            BuildTask::new("b", "B"),
            BuildTask::new("c", "C"),
            BuildTask::new("d", "D"),
        ]);
        graph.complete("a");
        graph.start("b");
        graph.fail("c", "x");

        let summary = graph.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.percent, 25);
    }

    #[test]
    fn test_ready_tasks_follow_dependencies() {
        let mut graph = two_step_graph();
        let ready: Vec<_> = graph.ready_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["t1"]);

        graph.complete("t1");
        let ready: Vec<_> = graph.ready_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["t2"]);
    }

    #[test]
    fn test_is_settled() {
        let mut graph = two_step_graph();
        assert!(!graph.is_settled());
        graph.complete("t1");
        graph.fail("t2", "x");
        assert!(graph.is_settled());
        assert!(TaskGraph::default().is_settled());
    }

    #[test]
    fn test_from_tasks_repairs_snapshot() {
        let mut failed = BuildTask::new("b", "B").depends_on(&["a", "a", "ghost", "b"]);
        failed.status = TaskStatus::Failed;
        let mut stray_error = BuildTask::new("a", "A");
        stray_error.error = Some("stale".to_string());

        let graph = TaskGraph::from_tasks(vec![
            stray_error,
            failed,
            BuildTask::new("a", "Duplicate"),
        ]);

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get("a").unwrap().name, "A");
        assert!(graph.get("a").unwrap().error.is_none());
        let b = graph.get("b").unwrap();
        assert_eq!(b.depends_on, vec!["a".to_string()]);
        assert_eq!(b.error.as_deref(), Some("Task failed"));
    }

    #[test]
    fn test_task_deserializes_from_planner_json() {
        let json = serde_json::json!({
            "id": "hero",
            "type": "section",
            "name": "Hero Section",
            "description": "Main header",
            "depends_on": ["style"],
            "status": "pending",
            "output_files": ["/components/Hero.html"],
            "error": null
        });
        let task: BuildTask = serde_json::from_value(json).unwrap();
        assert_eq!(task.task_type, "section");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.output_files, vec!["/components/Hero.html".to_string()]);
    }
}
