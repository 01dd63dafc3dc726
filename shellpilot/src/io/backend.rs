//! Reasoning backends that plan and validate steps.
//!
//! Local providers are CLIs: the rendered prompt goes to the program's stdin
//! and the answer (free text containing one JSON object) comes back on stdout.
//! Codex writes its final message to a file instead, which is read back after
//! the process exits. Hosted providers are called over HTTP through
//! [`crate::io::chat`] with an API key taken from the environment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::controller::{Planner, Validator};
use crate::core::response::{parse_step, parse_validation};
use crate::core::types::{ExecutionState, Step, ValidationOutcome};
use crate::io::chat::ChatClient;
use crate::io::config::{BackendSettings, Provider};
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::PromptEngine;

const STDERR_TAIL_LINES: usize = 20;

/// Backend settings that cannot work, caught before the run starts.
#[derive(Debug, thiserror::Error)]
pub enum BackendConfigError {
    #[error("{var} is not set; the {provider} backend needs an API key")]
    MissingApiKey {
        provider: Provider,
        var: &'static str,
    },
    #[error("{provider} backend program {program:?} not found (is it installed and on PATH?)")]
    ProgramNotFound { provider: Provider, program: String },
    #[error("backend.command must be a non-empty array")]
    EmptyCommand,
}

enum Transport {
    /// A program that reads the prompt on stdin.
    Process { argv: Vec<String> },
    /// An OpenAI-compatible chat-completions endpoint.
    Chat(ChatClient),
}

/// Planner and validator backed by a local program or a hosted model.
pub struct Backend {
    provider: Provider,
    transport: Transport,
    model: Option<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    prompts: PromptEngine,
}

impl Backend {
    /// Resolve `settings` into a ready backend, reading API keys from the environment.
    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        Self::from_settings_with_env(settings, |name| env::var(name).ok())
    }

    /// Like [`Backend::from_settings`], with `lookup` standing in for the environment.
    pub fn from_settings_with_env<F>(settings: &BackendSettings, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = settings.provider;
        let model = Some(settings.model.trim())
            .filter(|m| !m.is_empty())
            .or(provider.default_model())
            .map(str::to_string);
        let timeout = Duration::from_secs(settings.timeout_secs);

        let transport = match (provider.api_key_var(), provider.default_api_base()) {
            (Some(var), Some(default_base)) => {
                let api_key = lookup(var)
                    .filter(|key| !key.trim().is_empty())
                    .ok_or(BackendConfigError::MissingApiKey { provider, var })?;
                let api_base = Some(settings.api_base.trim())
                    .filter(|base| !base.is_empty())
                    .unwrap_or(default_base);
                let model = model
                    .clone()
                    .ok_or_else(|| anyhow!("{provider} backend needs a model name"))?;
                Transport::Chat(ChatClient::new(api_base, api_key, model, timeout)?)
            }
            _ => {
                let argv = match provider {
                    Provider::Ollama => vec!["ollama".to_string()],
                    Provider::Codex => vec!["codex".to_string()],
                    _ => settings.command.clone(),
                };
                let program = argv
                    .first()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or(BackendConfigError::EmptyCommand)?;
                if find_program(program).is_none() {
                    return Err(BackendConfigError::ProgramNotFound {
                        provider,
                        program: program.clone(),
                    }
                    .into());
                }
                Transport::Process { argv }
            }
        };

        Ok(Self {
            provider,
            transport,
            model,
            timeout,
            output_limit_bytes: settings.output_limit_bytes,
            prompts: PromptEngine::new()?,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn command(&self, argv: &[String], last_message: Option<&Path>) -> Command {
        let mut cmd = Command::new(&argv[0]);
        match self.provider {
            Provider::Ollama => {
                cmd.arg("run");
                if let Some(model) = &self.model {
                    cmd.arg(model);
                }
                cmd.args(["--format", "json"]);
            }
            Provider::Codex => {
                cmd.args(["exec", "--skip-git-repo-check"]);
                if let Some(model) = &self.model {
                    cmd.args(["--model", model]);
                }
                if let Some(path) = last_message {
                    cmd.arg("--output-last-message").arg(path);
                }
                cmd.arg("-");
            }
            _ => {
                cmd.args(&argv[1..]);
            }
        }
        cmd
    }

    /// Send `prompt` to the backend and return its answer text.
    #[instrument(skip_all, fields(provider = %self.provider, prompt_bytes = prompt.len()))]
    fn complete(&self, prompt: &str) -> Result<String> {
        match &self.transport {
            Transport::Process { argv } => self.run_program(argv, prompt),
            Transport::Chat(client) => client
                .complete(prompt)
                .with_context(|| format!("call {} backend", self.provider)),
        }
    }

    fn run_program(&self, argv: &[String], prompt: &str) -> Result<String> {
        let last_message = match self.provider {
            Provider::Codex => Some(NamedTempFile::new().context("create codex output file")?),
            _ => None,
        };
        let cmd = self.command(argv, last_message.as_ref().map(NamedTempFile::path));

        let out = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {} backend", self.provider))?;

        if out.timed_out {
            bail!(
                "{} backend timed out after {}s",
                self.provider,
                self.timeout.as_secs()
            );
        }
        if !out.status.success() {
            bail!(
                "{} backend exited with {}: {}",
                self.provider,
                out.status,
                out.stderr_tail(STDERR_TAIL_LINES)
            );
        }

        let text = match &last_message {
            Some(file) => {
                let message = fs::read_to_string(file.path())
                    .with_context(|| format!("read {}", file.path().display()))?;
                if message.trim().is_empty() {
                    out.stdout_text()
                } else {
                    message
                }
            }
            None => out.stdout_text(),
        };
        debug!(response_bytes = text.len(), "backend answered");
        Ok(text)
    }
}

impl Planner for Backend {
    fn propose(&self, instruction: &str, state: &ExecutionState) -> Result<Step> {
        let prompt = self.prompts.render_planner(instruction, state)?;
        let answer = self.complete(&prompt)?;
        Ok(parse_step(&answer)?)
    }
}

impl Validator for Backend {
    fn validate(
        &self,
        instruction: &str,
        step: &Step,
        state: &ExecutionState,
    ) -> Result<ValidationOutcome> {
        let prompt = self.prompts.render_validator(instruction, step, state)?;
        let answer = self.complete(&prompt)?;
        Ok(parse_validation(&answer)?)
    }
}

/// Locate `program` the way `execvp` would.
fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
