//! Configuration stored in `shellpilot.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::controller::ControllerConfig;
use crate::io::shell::ShellOptions;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "shellpilot.toml";

/// Top-level configuration (TOML).
///
/// Meant to be edited by hand. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellpilotConfig {
    /// Upper bound on loop iterations for one run.
    pub max_iterations: u32,

    /// Step timeout used when the planner does not request one.
    pub default_step_timeout_secs: u64,

    /// Requested step timeouts are clamped to this.
    pub max_step_timeout_secs: u64,

    pub shell: ShellSettings,
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellSettings {
    pub program: String,
    pub args: Vec<String>,
    pub term: String,
    pub startup_timeout_ms: u64,
    /// How long to wait for an interrupted command to unwind after a timeout.
    pub interrupt_grace_ms: u64,
    /// Command output kept per step; the rest is dropped with a notice.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSettings {
    pub provider: Provider,
    /// Model name; empty means the provider's default.
    pub model: String,
    /// Argv for `provider = "command"`. The prompt is written to its stdin.
    pub command: Vec<String>,
    /// Chat-completions base URL for the HTTP providers; empty means the provider's own.
    pub api_base: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

/// Reasoning backends known to shellpilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Local models through `ollama run`.
    Ollama,
    /// `codex exec` in non-interactive mode.
    Codex,
    /// Any program that reads a prompt on stdin and prints JSON.
    Command,
    /// OpenAI chat completions; needs `OPENAI_API_KEY`.
    #[value(name = "openai")]
    OpenAi,
    /// DeepSeek chat completions; needs `DEEPSEEK_API_KEY`.
    Deepseek,
    /// Gemini through its OpenAI-compatible endpoint; needs `GEMINI_API_KEY`.
    Gemini,
}

impl Provider {
    pub fn default_model(self) -> Option<&'static str> {
        match self {
            Provider::Ollama => Some("deepseek-r1"),
            Provider::OpenAi => Some("gpt-4"),
            Provider::Deepseek => Some("deepseek-chat"),
            Provider::Gemini => Some("gemini-1.5-flash"),
            Provider::Codex | Provider::Command => None,
        }
    }

    /// Environment variable holding the API key, for providers reached over HTTP.
    pub fn api_key_var(self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Deepseek => Some("DEEPSEEK_API_KEY"),
            Provider::Gemini => Some("GEMINI_API_KEY"),
            Provider::Ollama | Provider::Codex | Provider::Command => None,
        }
    }

    pub fn default_api_base(self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("https://api.openai.com/v1"),
            Provider::Deepseek => Some("https://api.deepseek.com/v1"),
            Provider::Gemini => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            Provider::Ollama | Provider::Codex | Provider::Command => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Provider::Ollama => "ollama",
            Provider::Codex => "codex",
            Provider::Command => "command",
            Provider::OpenAi => "openai",
            Provider::Deepseek => "deepseek",
            Provider::Gemini => "gemini",
        };
        f.write_str(name)
    }
}

impl Default for ShellpilotConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            default_step_timeout_secs: 60,
            max_step_timeout_secs: 600,
            shell: ShellSettings::default(),
            backend: BackendSettings::default(),
        }
    }
}

impl Default for ShellSettings {
    fn default() -> Self {
        let options = ShellOptions::default();
        Self {
            program: options.program,
            args: options.args,
            term: options.term,
            startup_timeout_ms: duration_ms(options.startup_timeout),
            interrupt_grace_ms: duration_ms(options.interrupt_grace),
            output_limit_bytes: options.output_limit_bytes,
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Ollama,
            model: String::new(),
            command: Vec::new(),
            api_base: String::new(),
            timeout_secs: 300,
            output_limit_bytes: 200_000,
        }
    }
}

impl ShellpilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.default_step_timeout_secs == 0 {
            return Err(anyhow!("default_step_timeout_secs must be > 0"));
        }
        if self.max_step_timeout_secs < self.default_step_timeout_secs {
            return Err(anyhow!(
                "max_step_timeout_secs must be >= default_step_timeout_secs"
            ));
        }
        if self.shell.program.trim().is_empty() {
            return Err(anyhow!("shell.program must be non-empty"));
        }
        if self.shell.startup_timeout_ms == 0 {
            return Err(anyhow!("shell.startup_timeout_ms must be > 0"));
        }
        if self.shell.output_limit_bytes == 0 {
            return Err(anyhow!("shell.output_limit_bytes must be > 0"));
        }
        if self.backend.timeout_secs == 0 {
            return Err(anyhow!("backend.timeout_secs must be > 0"));
        }
        if self.backend.output_limit_bytes == 0 {
            return Err(anyhow!("backend.output_limit_bytes must be > 0"));
        }
        if self.backend.provider == Provider::Command
            && self
                .backend
                .command
                .first()
                .is_none_or(|program| program.trim().is_empty())
        {
            return Err(anyhow!(
                "backend.command must be a non-empty array when provider = \"command\""
            ));
        }
        let api_base = self.backend.api_base.trim();
        if !api_base.is_empty()
            && !(api_base.starts_with("http://") || api_base.starts_with("https://"))
        {
            return Err(anyhow!("backend.api_base must be an http(s) URL"));
        }
        Ok(())
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            max_iterations: self.max_iterations,
            default_step_timeout: Duration::from_secs(self.default_step_timeout_secs),
            max_step_timeout: Duration::from_secs(self.max_step_timeout_secs),
        }
    }

    pub fn shell_options(&self) -> ShellOptions {
        ShellOptions {
            program: self.shell.program.clone(),
            args: self.shell.args.clone(),
            term: self.shell.term.clone(),
            workdir: None,
            startup_timeout: Duration::from_millis(self.shell.startup_timeout_ms),
            interrupt_grace: Duration::from_millis(self.shell.interrupt_grace_ms),
            output_limit_bytes: self.shell.output_limit_bytes,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ShellpilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<ShellpilotConfig> {
    if !path.exists() {
        let cfg = ShellpilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ShellpilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ShellpilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ShellpilotConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("shellpilot.toml");
        let mut cfg = ShellpilotConfig::default();
        cfg.backend.provider = Provider::Command;
        cfg.backend.command = vec!["./planner.sh".to_string()];
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("shellpilot.toml");
        fs::write(
            &path,
            "max_iterations = 5\n[backend]\nprovider = \"codex\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 5);
        assert_eq!(cfg.backend.provider, Provider::Codex);
        assert_eq!(cfg.shell, ShellSettings::default());
        assert_eq!(cfg.default_step_timeout_secs, 60);
    }

    #[test]
    fn command_provider_requires_argv() {
        let mut cfg = ShellpilotConfig::default();
        cfg.backend.provider = Provider::Command;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("backend.command"));
    }

    #[test]
    fn rejects_zero_limits() {
        let mut cfg = ShellpilotConfig::default();
        cfg.max_iterations = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ShellpilotConfig::default();
        cfg.default_step_timeout_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ShellpilotConfig::default();
        cfg.shell.program = " ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn http_providers_parse_and_know_their_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("shellpilot.toml");
        fs::write(&path, "[backend]\nprovider = \"openai\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.backend.provider, Provider::OpenAi);
        assert_eq!(Provider::OpenAi.api_key_var(), Some("OPENAI_API_KEY"));
        assert_eq!(Provider::Deepseek.default_model(), Some("deepseek-chat"));
        assert_eq!(Provider::Ollama.api_key_var(), None);
    }

    #[test]
    fn api_base_must_be_http() {
        let mut cfg = ShellpilotConfig::default();
        cfg.backend.api_base = "ftp://example.com".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("api_base"));

        cfg.backend.api_base = "http://127.0.0.1:8080/v1".to_string();
        cfg.validate().expect("valid");
    }

    #[test]
    fn unknown_provider_is_a_parse_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("shellpilot.toml");
        fs::write(&path, "[backend]\nprovider = \"carrier-pigeon\"\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse"));
    }

    #[test]
    fn converts_to_runtime_options() {
        let cfg = ShellpilotConfig::default();
        let options = cfg.shell_options();
        assert_eq!(options.program, "bash");
        assert_eq!(options.startup_timeout, Duration::from_secs(2));
        let controller = cfg.controller();
        assert_eq!(controller.max_iterations, 25);
        assert_eq!(controller.default_step_timeout, Duration::from_secs(60));
    }
}
