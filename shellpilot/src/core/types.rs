//! Shared data model for the propose–validate–execute loop.
//!
//! These types are plain data: they carry no process handles and perform no
//! I/O, so both the controller and the backends can reason about them in
//! isolation.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Exit code reported when a command does not finish within its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code used when the captured exit code text is not an integer.
pub const UNPARSED_EXIT_CODE: i32 = 1;

/// A unit of work proposed by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// What this step is for.
    #[serde(default)]
    pub step: String,
    /// Shell command text to run.
    pub command: String,
    /// Why the planner picked this command.
    #[serde(default)]
    pub reason: String,
    /// Requested timeout in seconds. `None` uses the configured default.
    #[serde(
        default,
        rename = "timeout",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "whole_seconds"
    )]
    pub timeout_secs: Option<u64>,
    /// Planner's claim that the task is finished once this step succeeds.
    #[serde(default)]
    pub completed: bool,
}

/// Accept `30` and `30.0` alike; fractional or negative values are errors.
fn whole_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(secs) = Option::<f64>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if !secs.is_finite() || secs < 0.0 || secs.fract() != 0.0 {
        return Err(D::Error::custom(format!(
            "timeout must be a whole number of seconds, got {secs}"
        )));
    }
    // Saturates above u64::MAX; the controller clamps to its ceiling anyway.
    Ok(Some(secs as u64))
}

/// Validator verdict for a proposed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
    /// Replacement command to run instead of the proposed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification: Option<String>,
}

impl ValidationOutcome {
    pub fn approve(feedback: impl Into<String>) -> Self {
        Self {
            approved: true,
            feedback: feedback.into(),
            modification: None,
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: feedback.into(),
            modification: None,
        }
    }

    /// Command to execute for `step`: the modification when present, else the proposal.
    pub fn effective_command<'a>(&'a self, step: &'a Step) -> &'a str {
        match self.modification.as_deref().map(str::trim) {
            Some(modified) if !modified.is_empty() => modified,
            _ => step.command.trim(),
        }
    }
}

/// Captured outcome of one shell round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub exit_code: i32,
    pub success: bool,
    /// Markers were not observed before the deadline.
    #[serde(default)]
    pub timed_out: bool,
    /// The shell process exited while the command was running.
    #[serde(default)]
    pub shell_died: bool,
    /// The exit code text could not be parsed and was replaced.
    #[serde(default)]
    pub exit_code_unparsed: bool,
}

impl ExecutionResult {
    pub fn new(output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: output.into(),
            exit_code,
            success: exit_code == 0,
            timed_out: false,
            shell_died: false,
            exit_code_unparsed: false,
        }
    }

    pub fn timed_out(output: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::new(output, TIMEOUT_EXIT_CODE)
        }
    }

    /// A dead shell never counts as success, so a clean exit is reported as 1.
    pub fn shell_died(output: impl Into<String>, exit_code: i32) -> Self {
        let exit_code = if exit_code == 0 { 1 } else { exit_code };
        Self {
            shell_died: true,
            ..Self::new(output, exit_code)
        }
    }
}

/// Permanent record of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// 1-indexed iteration number.
    pub iteration: u32,
    pub step: Step,
    /// Command that actually ran; empty when the step was rejected.
    pub command: String,
    pub validation: ValidationOutcome,
    pub result: Option<ExecutionResult>,
}

impl HistoryEntry {
    pub fn was_executed(&self) -> bool {
        self.result.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.success)
    }
}

/// Accumulated state of a run, shared read-only with the planner and validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    history: Vec<HistoryEntry>,
    completed: bool,
    feedback: Vec<String>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn feedback(&self) -> &[String] {
        &self.feedback
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// Entries whose command actually ran.
    pub fn executed(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter().filter(|e| e.was_executed())
    }

    /// Record an approved step and its result, updating completion.
    pub fn record_execution(
        &mut self,
        step: Step,
        validation: ValidationOutcome,
        command: String,
        result: ExecutionResult,
    ) -> &HistoryEntry {
        self.completed = step.completed && result.success;
        let iteration = self.next_iteration();
        self.history.push(HistoryEntry {
            iteration,
            step,
            command,
            validation,
            result: Some(result),
        });
        self.last_pushed()
    }

    /// Record a rejected step and push its feedback onto the feedback channel.
    pub fn record_rejection(&mut self, step: Step, validation: ValidationOutcome) -> &HistoryEntry {
        self.completed = false;
        self.feedback.push(validation.feedback.clone());
        let iteration = self.next_iteration();
        self.history.push(HistoryEntry {
            iteration,
            step,
            command: String::new(),
            validation,
            result: None,
        });
        self.last_pushed()
    }

    fn next_iteration(&self) -> u32 {
        u32::try_from(self.history.len()).unwrap_or(u32::MAX - 1) + 1
    }

    fn last_pushed(&self) -> &HistoryEntry {
        // Only called right after a push.
        &self.history[self.history.len() - 1]
    }
}
