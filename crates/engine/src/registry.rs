//! Maps task IDs to the implementations that execute them.

use std::collections::HashMap;
use std::sync::Arc;

use tasks::shell::DEFAULT_SKIP_EXIT_CODE;
use tasks::{ExecutableTask, ShellTask, ShellTaskConfig};

use crate::models::{Pipeline, TaskDefinition};

/// Task implementations keyed by task ID.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn ExecutableTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`ShellTask`] per task definition.
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        let mut registry = Self::new();
        for def in &pipeline.tasks {
            registry.register(def.id.clone(), Arc::new(ShellTask::new(shell_config(pipeline, def))));
        }
        registry
    }

    /// Register (or replace) the implementation for `task_id`.
    pub fn register(&mut self, task_id: impl Into<String>, task: Arc<dyn ExecutableTask>) {
        self.tasks.insert(task_id.into(), task);
    }

    pub fn get(&self, task_id: &str) -> Option<&Arc<dyn ExecutableTask>> {
        self.tasks.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Resolve a definition against the pipeline's `default_args`.
pub fn shell_config(pipeline: &Pipeline, def: &TaskDefinition) -> ShellTaskConfig {
    ShellTaskConfig {
        command: def.command.clone(),
        cwd: def.cwd.clone(),
        env: pipeline.env_for(def),
        execution_timeout: pipeline.execution_timeout_for(def),
        skip_exit_code: Some(def.skip_exit_code.unwrap_or(DEFAULT_SKIP_EXIT_CODE)),
    }
}
