//! In-memory task registry.
//!
//! Tasks move `Unassigned -> Assigned -> Complete` and never back. An assigned
//! task whose worker disappears stays assigned: there is no lease and no
//! reassignment.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use planductor_common::{PlanResult, TaskSpec};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Unassigned,
    Assigned,
    Complete,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskRecord {
    pub spec: TaskSpec,
    pub state: AssignmentState,
    /// Worker the task was handed to. Set once, never cleared.
    pub owner: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub results: Vec<PlanResult>,
}

impl TaskRecord {
    fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            state: AssignmentState::Unassigned,
            owner: None,
            assigned_at: None,
            completed_at: None,
            output: String::new(),
            results: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.name
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task '{0}' not found")]
    NotFound(String),
    #[error("task '{0}' is already complete")]
    AlreadyComplete(String),
    #[error("task '{0}' was never assigned")]
    NotAssigned(String),
    #[error("task '{0}' is registered twice")]
    Duplicate(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub unassigned: usize,
    pub assigned: usize,
    pub complete: usize,
}

/// Registration-ordered task table, owned by the dispatcher's control loop.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<TaskRecord>,
    index: HashMap<String, usize>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a seed list; duplicate names are rejected.
    pub fn from_specs(specs: impl IntoIterator<Item = TaskSpec>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, spec: TaskSpec) -> Result<(), RegistryError> {
        if self.index.contains_key(&spec.name) {
            return Err(RegistryError::Duplicate(spec.name));
        }
        self.index.insert(spec.name.clone(), self.tasks.len());
        self.tasks.push(TaskRecord::new(spec));
        Ok(())
    }

    /// First unassigned task in registration order, stamped with `requester`
    /// as its owner before it is returned.
    pub fn next_available(&mut self, requester: &str) -> Option<TaskSpec> {
        let record = self
            .tasks
            .iter_mut()
            .find(|record| record.state == AssignmentState::Unassigned)?;
        record.state = AssignmentState::Assigned;
        record.owner = Some(requester.to_string());
        record.assigned_at = Some(Utc::now());
        Some(record.spec.clone())
    }

    pub fn complete(
        &mut self,
        task_id: &str,
        results: Vec<PlanResult>,
        end_time: DateTime<Utc>,
        output: String,
    ) -> Result<&TaskRecord, RegistryError> {
        let position = *self
            .index
            .get(task_id)
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))?;
        let record = &mut self.tasks[position];
        match record.state {
            AssignmentState::Unassigned => Err(RegistryError::NotAssigned(task_id.to_string())),
            AssignmentState::Complete => Err(RegistryError::AlreadyComplete(task_id.to_string())),
            AssignmentState::Assigned => {
                record.state = AssignmentState::Complete;
                record.completed_at = Some(end_time);
                record.output = output;
                record.results = results;
                Ok(&*record)
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskRecord> {
        self.index.get(task_id).map(|&position| &self.tasks[position])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for record in &self.tasks {
            match record.state {
                AssignmentState::Unassigned => summary.unassigned += 1,
                AssignmentState::Assigned => summary.assigned += 1,
                AssignmentState::Complete => summary.complete += 1,
            }
        }
        summary
    }
}
