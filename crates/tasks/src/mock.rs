//! `MockTask`: a test double for `ExecutableTask`.
//!
//! Useful in unit and integration tests where spawning real processes is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::{ExecutableTask, TaskContext, TaskError};

/// Behaviour injected into `MockTask` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error on the first `failures` calls, then succeed.
    FlakyThenSucceed { failures: usize, value: Value },
    /// Always fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Ask to be skipped.
    Skip(String),
}

/// A mock task that records every attempt it receives and returns a
/// programmer-specified result.
pub struct MockTask {
    /// Label used in test assertions.
    pub name: String,
    /// What the task will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// `try_number` of every attempt seen by this task (in call order).
    pub calls: Arc<Mutex<Vec<u32>>>,
}

impl MockTask {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that fails `failures` times with a `Retryable` error, then succeeds.
    pub fn flaky(name: impl Into<String>, failures: usize) -> Self {
        Self::with_behaviour(
            name,
            MockBehaviour::FlakyThenSucceed {
                failures,
                value: json!({}),
            },
        )
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always asks to be skipped.
    pub fn skipping(name: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Skip("mock skip".into()))
    }

    /// Number of times this task has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// `try_number` of every attempt, in order.
    pub fn try_numbers(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutableTask for MockTask {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ctx.try_number);
            calls.len()
        };

        let succeed_with = |v: &Value| {
            // Tag the output with the task name so tests can trace it.
            let mut out = json!({ "task": self.name });
            if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                for (k, val) in v_obj {
                    out_obj.insert(k.clone(), val.clone());
                }
            }
            out
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(succeed_with(v)),
            MockBehaviour::FlakyThenSucceed { failures, value } => {
                if call_index <= *failures {
                    Err(TaskError::Retryable(format!(
                        "{} flaked on call {call_index}",
                        self.name
                    )))
                } else {
                    Ok(succeed_with(value))
                }
            }
            MockBehaviour::FailRetryable(msg) => Err(TaskError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(TaskError::Fatal(msg.clone())),
            MockBehaviour::Skip(msg) => Err(TaskError::Skipped(msg.clone())),
        }
    }
}
