use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Executing => 1,
            TaskStatus::Completed => 2,
            TaskStatus::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Planning,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "pending")]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn pending() -> TaskStatus {
    TaskStatus::Pending
}

impl SubTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            required_tools: Vec::new(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tools = tools.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanProgress {
    /// completed / total, in `0.0..=1.0`. A plan with no tasks reports 1.
    pub overall: f64,
    /// Most recently started task, if any.
    pub current_task: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no task with id '{0}'")]
    UnknownTask(String),
    #[error("task '{task}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Task graph derived from goal decomposition. Tasks keep their creation
/// order; `next_task` scans that order for the first pending task whose
/// dependencies are all completed. Tasks whose dependency set can never
/// complete are failed on the scan rather than left pending forever.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    tasks: Vec<SubTask>,
    index: HashMap<String, usize>,
    current: Option<String>,
}

impl ExecutionPlan {
    pub fn new(tasks: Vec<SubTask>) -> Self {
        let index = tasks
            .iter()
            .enumerate()
            .map(|(position, task)| (task.id.clone(), position))
            .collect();
        Self {
            tasks,
            index,
            current: None,
        }
    }

    pub fn tasks(&self) -> &[SubTask] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&SubTask> {
        self.index.get(id).map(|&position| &self.tasks[position])
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// First runnable task in creation order, after failing any task that
    /// is doomed by a failed dependency.
    pub fn next_task(&mut self) -> Option<SubTask> {
        self.fail_doomed();
        let position = self.tasks.iter().position(|task| {
            task.status == TaskStatus::Pending && self.dependencies_completed(task)
        })?;
        Some(self.tasks[position].clone())
    }

    fn dependencies_completed(&self, task: &SubTask) -> bool {
        task.depends_on.iter().all(|dep| {
            self.index
                .get(dep)
                .map(|&position| self.tasks[position].status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Marks pending tasks failed when any dependency has failed (or names
    /// a task that does not exist). Runs to a fixpoint so chains of doomed
    /// tasks settle in one scan.
    fn fail_doomed(&mut self) {
        loop {
            let doomed: Vec<usize> = self
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, task)| task.status == TaskStatus::Pending)
                .filter(|(_, task)| {
                    task.depends_on.iter().any(|dep| match self.index.get(dep) {
                        Some(&position) => self.tasks[position].status == TaskStatus::Failed,
                        None => true,
                    })
                })
                .map(|(position, _)| position)
                .collect();
            if doomed.is_empty() {
                break;
            }
            for position in doomed {
                let task = &mut self.tasks[position];
                warn!(task = %task.id, "task failed: dependency can never complete");
                task.status = TaskStatus::Failed;
                task.error = Some("dependency failed".to_string());
            }
        }
    }

    pub fn update_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), PlanError> {
        let position = *self
            .index
            .get(id)
            .ok_or_else(|| PlanError::UnknownTask(id.to_string()))?;
        let task = &mut self.tasks[position];
        let from = task.status;
        let backward = status.rank() < from.rank();
        if from.is_terminal() || backward {
            return Err(PlanError::InvalidTransition {
                task: id.to_string(),
                from,
                to: status,
            });
        }
        debug!(task = id, ?from, to = ?status, "task status updated");
        task.status = status;
        if result.is_some() {
            task.result = result;
        }
        if error.is_some() {
            task.error = error;
        }
        if status == TaskStatus::Executing {
            self.current = Some(id.to_string());
        }
        Ok(())
    }

    pub fn progress(&self) -> PlanProgress {
        let total = self.tasks.len();
        let completed = self
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .count();
        let overall = if total == 0 {
            1.0
        } else {
            completed as f64 / total as f64
        };
        PlanProgress {
            overall,
            current_task: self.current.clone(),
        }
    }

    pub fn status(&self) -> PlanStatus {
        if self.tasks.is_empty() {
            return PlanStatus::Completed;
        }
        if self.tasks.iter().all(|task| task.status == TaskStatus::Completed) {
            return PlanStatus::Completed;
        }
        let any_open = self
            .tasks
            .iter()
            .any(|task| !task.status.is_terminal());
        if any_open {
            PlanStatus::Executing
        } else {
            PlanStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_step_plan() -> ExecutionPlan {
        ExecutionPlan::new(vec![
            SubTask::new("a", "gather"),
            SubTask::new("b", "analyze").with_dependencies(["a"]),
            SubTask::new("c", "report").with_dependencies(["b"]),
        ])
    }

    #[test]
    fn next_task_follows_creation_order_and_dependencies() {
        let mut plan = three_step_plan();
        assert_eq!(plan.next_task().expect("first").id, "a");

        plan.update_status("a", TaskStatus::Executing, None, None)
            .expect("start a");
        // b is blocked until a completes.
        assert!(plan.next_task().is_none());

        plan.update_status("a", TaskStatus::Completed, None, None)
            .expect("finish a");
        assert_eq!(plan.next_task().expect("second").id, "b");
    }

    #[test]
    fn completing_every_task_reaches_full_progress() {
        let mut plan = three_step_plan();
        for id in ["a", "b", "c"] {
            assert_eq!(plan.next_task().expect("runnable").id, id);
            plan.update_status(id, TaskStatus::Executing, None, None)
                .expect("start");
            plan.update_status(id, TaskStatus::Completed, None, None)
                .expect("finish");
        }
        assert!(plan.next_task().is_none());
        assert!((plan.progress().overall - 1.0).abs() < f64::EPSILON);
        assert_eq!(plan.status(), PlanStatus::Completed);
    }

    #[test]
    fn failed_dependency_cascades_without_deadlock() {
        let mut plan = three_step_plan();
        plan.update_status("a", TaskStatus::Executing, None, None)
            .expect("start");
        plan.update_status("a", TaskStatus::Failed, None, Some("boom".into()))
            .expect("fail");

        // b and c can never run; the next scan settles both.
        assert!(plan.next_task().is_none());
        assert_eq!(plan.task("b").expect("b").status, TaskStatus::Failed);
        assert_eq!(plan.task("c").expect("c").status, TaskStatus::Failed);
        assert_eq!(plan.status(), PlanStatus::Failed);
    }

    #[test]
    fn unknown_dependency_counts_as_failed() {
        let mut plan = ExecutionPlan::new(vec![
            SubTask::new("a", "ok"),
            SubTask::new("b", "broken").with_dependencies(["ghost"]),
        ]);
        assert_eq!(plan.next_task().expect("a runs").id, "a");
        assert_eq!(plan.task("b").expect("b").status, TaskStatus::Failed);
    }

    #[test]
    fn tasks_never_move_backward() {
        let mut plan = three_step_plan();
        plan.update_status("a", TaskStatus::Executing, None, None)
            .expect("start");
        plan.update_status("a", TaskStatus::Completed, None, None)
            .expect("finish");

        let result = plan.update_status("a", TaskStatus::Pending, None, None);
        assert!(matches!(result, Err(PlanError::InvalidTransition { .. })));
        let result = plan.update_status("a", TaskStatus::Executing, None, None);
        assert!(matches!(result, Err(PlanError::InvalidTransition { .. })));
    }

    #[test]
    fn progress_tracks_current_task() {
        let mut plan = three_step_plan();
        plan.update_status("a", TaskStatus::Executing, None, None)
            .expect("start");
        assert_eq!(plan.progress().current_task.as_deref(), Some("a"));
        assert!((plan.progress().overall - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_plan_is_complete() {
        let plan = ExecutionPlan::new(Vec::new());
        assert!((plan.progress().overall - 1.0).abs() < f64::EPSILON);
        assert_eq!(plan.status(), PlanStatus::Completed);
    }
}
