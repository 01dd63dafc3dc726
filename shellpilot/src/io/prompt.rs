//! Prompt rendering for the planner and validator backends.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{ExecutionState, HistoryEntry, Step};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const VALIDATOR_TEMPLATE: &str = include_str!("prompts/validator.md");

/// One history entry flattened for the planner template.
#[derive(Debug, Clone, Serialize)]
struct HistoryContext {
    iteration: u32,
    executed: bool,
    proposed: String,
    command: String,
    reason: String,
    status: &'static str,
    exit_code: Option<i32>,
    output: String,
}

impl HistoryContext {
    fn from_entry(entry: &HistoryEntry) -> Self {
        let result = entry.result.as_ref();
        let status = match result {
            None => "rejected",
            Some(r) if r.timed_out => "timed out",
            Some(r) if r.shell_died => "shell exited",
            Some(r) if r.success => "success",
            Some(_) => "failed",
        };
        let output = result.map(|r| r.output.trim()).unwrap_or_default();
        Self {
            iteration: entry.iteration,
            executed: result.is_some(),
            proposed: entry.step.command.clone(),
            command: entry.command.clone(),
            reason: non_empty_or(&entry.step.reason, "No reason provided"),
            status,
            exit_code: result.map(|r| r.exit_code),
            output: non_empty_or(output, "(no output)"),
        }
    }
}

fn non_empty_or(text: &str, fallback: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("planner", PLANNER_TEMPLATE)
            .context("load planner template")?;
        env.add_template("validator", VALIDATOR_TEMPLATE)
            .context("load validator template")?;
        Ok(Self { env })
    }

    pub fn render_planner(&self, instruction: &str, state: &ExecutionState) -> Result<String> {
        let history: Vec<HistoryContext> = state
            .history()
            .iter()
            .map(HistoryContext::from_entry)
            .collect();
        let last_status = state
            .last_entry()
            .map(|entry| HistoryContext::from_entry(entry).status)
            .unwrap_or("not started");

        let template = self.env.get_template("planner")?;
        let rendered = template
            .render(context! {
                instruction => instruction.trim(),
                executed_count => state.executed().count(),
                last_status => last_status,
                history => history,
                feedback => state.feedback(),
            })
            .context("render planner prompt")?;
        Ok(rendered)
    }

    pub fn render_validator(
        &self,
        instruction: &str,
        step: &Step,
        state: &ExecutionState,
    ) -> Result<String> {
        let previous_commands: Vec<&str> =
            state.executed().map(|entry| entry.command.as_str()).collect();
        let last_output = state
            .executed()
            .last()
            .and_then(|entry| entry.result.as_ref())
            .map(|result| result.output.trim())
            .filter(|output| !output.is_empty());

        let template = self.env.get_template("validator")?;
        let rendered = template
            .render(context! {
                instruction => instruction.trim(),
                step => step,
                previous_commands => previous_commands,
                last_output => last_output,
            })
            .context("render validator prompt")?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecutionResult, ValidationOutcome};

    fn step(command: &str) -> Step {
        Step {
            step: format!("run {command}"),
            command: command.to_string(),
            reason: "needed".to_string(),
            timeout_secs: None,
            completed: false,
        }
    }

    fn sample_state() -> ExecutionState {
        let mut state = ExecutionState::new();
        state.record_execution(
            step("cat notes.txt"),
            ValidationOutcome::approve("ok"),
            "cat notes.txt".to_string(),
            ExecutionResult::new("remember the milk", 0),
        );
        state.record_rejection(step("shutdown -h now"), ValidationOutcome::reject("no shutdowns"));
        state
    }

    #[test]
    fn planner_prompt_lists_history_and_feedback() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_planner("summarize notes.txt", &sample_state())
            .expect("render");

        assert!(prompt.contains("summarize notes.txt"));
        assert!(prompt.contains("Steps executed: 1"));
        assert!(prompt.contains("`cat notes.txt`"));
        assert!(prompt.contains("remember the milk"));
        assert!(prompt.contains("success (exit code 0)"));
        assert!(prompt.contains("`shutdown -h now` (rejected by the validator)"));
        assert!(prompt.contains("1. no shutdowns"));
        assert!(prompt.contains("Last status: rejected"));
    }

    #[test]
    fn planner_prompt_for_fresh_run() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_planner("list files", &ExecutionState::new())
            .expect("render");
        assert!(prompt.contains("No steps executed yet."));
        assert!(prompt.contains("No feedback yet."));
        assert!(prompt.contains("Last status: not started"));
    }

    #[test]
    fn validator_prompt_includes_step_and_context() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_validator("summarize notes.txt", &step("wc -l notes.txt"), &sample_state())
            .expect("render");

        assert!(prompt.contains("Command: `wc -l notes.txt`"));
        assert!(prompt.contains("- `cat notes.txt`"));
        assert!(!prompt.contains("- `shutdown -h now`"));
        assert!(prompt.contains("remember the milk"));
        assert!(prompt.contains("Never approve reboot"));
    }
}
