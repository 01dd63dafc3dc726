//! Scripted planner, validator, and runner doubles for loop tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::controller::{CommandRunner, Planner, Validator};
use crate::core::types::{ExecutionResult, ExecutionState, Step, ValidationOutcome};
use crate::io::shell::ShellError;

/// Build a step with deterministic description and reason.
pub fn step(command: &str, completed: bool) -> Step {
    Step {
        step: format!("run {command}"),
        command: command.to_string(),
        reason: "scripted".to_string(),
        timeout_secs: None,
        completed,
    }
}

/// Planner that returns queued steps in order and errors once they run out.
pub struct ScriptedPlanner {
    steps: RefCell<VecDeque<Step>>,
    repeat: Option<Step>,
    seen_feedback: RefCell<Vec<Vec<String>>>,
}

impl ScriptedPlanner {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: RefCell::new(steps.into()),
            repeat: None,
            seen_feedback: RefCell::new(Vec::new()),
        }
    }

    /// Planner that proposes the same step forever.
    pub fn repeating(step: Step) -> Self {
        Self {
            repeat: Some(step),
            ..Self::new(Vec::new())
        }
    }

    /// Feedback channel contents observed on each `propose` call.
    pub fn seen_feedback(&self) -> Vec<Vec<String>> {
        self.seen_feedback.borrow().clone()
    }
}

impl Planner for ScriptedPlanner {
    fn propose(&self, _instruction: &str, state: &ExecutionState) -> Result<Step> {
        self.seen_feedback
            .borrow_mut()
            .push(state.feedback().to_vec());
        if let Some(step) = self.steps.borrow_mut().pop_front() {
            return Ok(step);
        }
        self.repeat
            .clone()
            .ok_or_else(|| anyhow!("scripted planner has no more steps"))
    }
}

/// Validator that returns queued verdicts, or approves everything.
pub struct ScriptedValidator {
    outcomes: RefCell<VecDeque<ValidationOutcome>>,
    approve_all: bool,
}

impl ScriptedValidator {
    pub fn new(outcomes: Vec<ValidationOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            approve_all: false,
        }
    }

    pub fn approve_all() -> Self {
        Self {
            approve_all: true,
            ..Self::new(Vec::new())
        }
    }
}

impl Validator for ScriptedValidator {
    fn validate(
        &self,
        _instruction: &str,
        _step: &Step,
        _state: &ExecutionState,
    ) -> Result<ValidationOutcome> {
        if self.approve_all {
            return Ok(ValidationOutcome::approve("approved"));
        }
        self.outcomes
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted validator has no more outcomes"))
    }
}

/// Runner that records every command and timeout it receives.
pub struct ScriptedRunner {
    results: VecDeque<ExecutionResult>,
    failure: Option<fn() -> ShellError>,
    calls: Vec<(String, Duration)>,
}

impl ScriptedRunner {
    /// Return queued results in order, then succeed with empty output.
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        Self {
            results: results.into(),
            failure: None,
            calls: Vec::new(),
        }
    }

    pub fn succeed_all() -> Self {
        Self::new(Vec::new())
    }

    /// Runner whose every call fails with the error built by `make`.
    pub fn failing(make: fn() -> ShellError) -> Self {
        Self {
            failure: Some(make),
            ..Self::new(Vec::new())
        }
    }

    pub fn commands(&self) -> Vec<&str> {
        self.calls.iter().map(|(command, _)| command.as_str()).collect()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.calls.iter().map(|(_, timeout)| *timeout).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> std::result::Result<ExecutionResult, ShellError> {
        if let Some(make) = self.failure {
            return Err(make());
        }
        self.calls.push((command.to_string(), timeout));
        Ok(self
            .results
            .pop_front()
            .unwrap_or_else(|| ExecutionResult::new("", 0)))
    }
}
