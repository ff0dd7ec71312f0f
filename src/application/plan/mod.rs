mod tracker;

pub use tracker::{ExecutionPlan, PlanError, PlanProgress, PlanStatus, SubTask, TaskStatus};
