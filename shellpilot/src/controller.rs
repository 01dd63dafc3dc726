//! Propose → validate → execute loop.
//!
//! The controller owns a planner, a validator, and a command runner. Each
//! iteration asks the planner for a [`Step`], asks the validator whether it may
//! run, and either executes the (possibly modified) command or records the
//! rejection so the planner sees the feedback next time. The loop ends when
//! the latest executed step claims completion and succeeded, or when the
//! iteration cap is reached.

use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::budget::resolve_step_timeout;
use crate::core::types::{ExecutionResult, ExecutionState, HistoryEntry, Step, ValidationOutcome};
use crate::io::shell::ShellError;

/// Proposes the next step for an instruction given everything done so far.
pub trait Planner {
    fn propose(&self, instruction: &str, state: &ExecutionState) -> anyhow::Result<Step>;
}

/// Approves, rejects, or rewrites a proposed step.
pub trait Validator {
    fn validate(
        &self,
        instruction: &str,
        step: &Step,
        state: &ExecutionState,
    ) -> anyhow::Result<ValidationOutcome>;
}

impl<T: Planner + ?Sized> Planner for &T {
    fn propose(&self, instruction: &str, state: &ExecutionState) -> anyhow::Result<Step> {
        (**self).propose(instruction, state)
    }
}

impl<T: Validator + ?Sized> Validator for &T {
    fn validate(
        &self,
        instruction: &str,
        step: &Step,
        state: &ExecutionState,
    ) -> anyhow::Result<ValidationOutcome> {
        (**self).validate(instruction, step, state)
    }
}

/// Runs one shell command and reports its outcome.
///
/// [`crate::io::shell::ShellSession`] is the production implementation.
pub trait CommandRunner {
    fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, ShellError>;
}

/// Limits applied by [`StepController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub max_iterations: u32,
    /// Used when a step does not request a timeout.
    pub default_step_timeout: Duration,
    /// Ceiling for requested step timeouts.
    pub max_step_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            default_step_timeout: Duration::from_secs(60),
            max_step_timeout: Duration::from_secs(600),
        }
    }
}

/// Fatal errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("planner failed on iteration {iteration}")]
    Planner {
        iteration: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("validator failed on iteration {iteration}")]
    Validator {
        iteration: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("approved step on iteration {iteration} has an empty command")]
    EmptyCommand { iteration: u32 },
    #[error("shell unavailable")]
    Shell(#[from] ShellError),
}

/// Progress notifications passed to the observer callback.
#[derive(Debug)]
pub enum LoopEvent<'a> {
    Planning {
        iteration: u32,
    },
    Proposed {
        iteration: u32,
        step: &'a Step,
    },
    Validating {
        iteration: u32,
    },
    Rejected {
        entry: &'a HistoryEntry,
    },
    Executing {
        iteration: u32,
        command: &'a str,
        timeout: Duration,
    },
    Executed {
        entry: &'a HistoryEntry,
    },
}

/// Reason why [`StepController::run`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The latest step claimed completion and its command succeeded.
    Completed,
    /// The run used up `max_iterations` without completing.
    MaxIterationsExceeded { next_iter: u32, max_iterations: u32 },
}

/// Summary of a [`StepController::run`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Iterations performed by this call.
    pub iterations: u32,
    pub stop: LoopStop,
    pub state: ExecutionState,
}

pub struct StepController<P, V, R> {
    planner: P,
    validator: V,
    runner: R,
    config: ControllerConfig,
    state: ExecutionState,
}

impl<P: Planner, V: Validator, R: CommandRunner> StepController<P, V, R> {
    pub fn new(planner: P, validator: V, runner: R, config: ControllerConfig) -> Self {
        Self {
            planner,
            validator,
            runner,
            config,
            state: ExecutionState::new(),
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Hand back the runner so the caller can shut it down.
    pub fn into_runner(self) -> R {
        self.runner
    }

    /// Iterate until the state is completed or `max_iterations` is reached.
    ///
    /// Planner, validator, and shell-startup failures abort immediately; no
    /// call is retried.
    #[instrument(skip_all, fields(max_iterations = self.config.max_iterations))]
    pub fn run<F>(
        &mut self,
        instruction: &str,
        mut on_event: F,
    ) -> Result<LoopOutcome, ControllerError>
    where
        F: FnMut(&LoopEvent<'_>),
    {
        let mut iterations = 0u32;
        while !self.state.is_completed() {
            if iterations >= self.config.max_iterations {
                warn!(iterations, "iteration limit reached before completion");
                return Ok(LoopOutcome {
                    iterations,
                    stop: LoopStop::MaxIterationsExceeded {
                        next_iter: self.next_iteration(),
                        max_iterations: self.config.max_iterations,
                    },
                    state: self.state.clone(),
                });
            }
            self.run_iteration(instruction, &mut on_event)?;
            iterations += 1;
        }

        info!(iterations, "task completed");
        Ok(LoopOutcome {
            iterations,
            stop: LoopStop::Completed,
            state: self.state.clone(),
        })
    }

    /// Perform one plan/validate/execute-or-reject cycle and return its record.
    pub fn run_iteration<F>(
        &mut self,
        instruction: &str,
        on_event: &mut F,
    ) -> Result<&HistoryEntry, ControllerError>
    where
        F: FnMut(&LoopEvent<'_>),
    {
        let iteration = self.next_iteration();

        on_event(&LoopEvent::Planning { iteration });
        let step = self
            .planner
            .propose(instruction, &self.state)
            .map_err(|source| ControllerError::Planner { iteration, source })?;
        info!(iteration, step = %step.step, command = %step.command, "step proposed");
        on_event(&LoopEvent::Proposed {
            iteration,
            step: &step,
        });

        on_event(&LoopEvent::Validating { iteration });
        let validation = self
            .validator
            .validate(instruction, &step, &self.state)
            .map_err(|source| ControllerError::Validator { iteration, source })?;

        if !validation.approved {
            info!(iteration, feedback = %validation.feedback, "step rejected");
            let entry = self.state.record_rejection(step, validation);
            on_event(&LoopEvent::Rejected { entry });
            return Ok(entry);
        }

        let command = validation.effective_command(&step).to_string();
        if command.is_empty() {
            return Err(ControllerError::EmptyCommand { iteration });
        }
        let timeout = resolve_step_timeout(
            step.timeout_secs,
            self.config.default_step_timeout,
            self.config.max_step_timeout,
        );

        on_event(&LoopEvent::Executing {
            iteration,
            command: &command,
            timeout,
        });
        let result = self.runner.execute(&command, timeout)?;
        info!(iteration, exit_code = result.exit_code, "step executed");

        let entry = self
            .state
            .record_execution(step, validation, command, result);
        on_event(&LoopEvent::Executed { entry });
        Ok(entry)
    }

    fn next_iteration(&self) -> u32 {
        u32::try_from(self.state.history().len()).unwrap_or(u32::MAX - 1) + 1
    }
}
