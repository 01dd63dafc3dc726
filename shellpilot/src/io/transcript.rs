//! Per-run transcript files under the `--log-dir` directory.
//!
//! Layout: `<log-dir>/<run-id>/<iteration>.json` for each history entry as it
//! is recorded, plus `state.json` with the final execution state.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;

use crate::core::types::{ExecutionState, HistoryEntry};

/// Generate a run id like `run-k3x9qa`.
pub fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("run-{suffix}")
}

#[derive(Debug, Clone)]
pub struct Transcript {
    run_id: String,
    dir: PathBuf,
}

impl Transcript {
    /// Create `<log_dir>/<run_id>/`.
    pub fn create(log_dir: &Path, run_id: &str) -> Result<Self> {
        let dir = log_dir.join(run_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create transcript dir {}", dir.display()))?;
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("{iteration}.json"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    pub fn write_entry(&self, entry: &HistoryEntry) -> Result<PathBuf> {
        let path = self.entry_path(entry.iteration);
        write_json(&path, entry)?;
        Ok(path)
    }

    pub fn write_state(&self, state: &ExecutionState) -> Result<PathBuf> {
        let path = self.state_path();
        write_json(&path, state)?;
        Ok(path)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize transcript json")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ExecutionResult, Step, ValidationOutcome};

    #[test]
    fn run_ids_are_short_and_lowercase() {
        let id = generate_run_id();
        assert_eq!(id.len(), "run-".len() + 6);
        assert!(id.starts_with("run-"));
        assert!(
            id[4..]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn writes_entries_and_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transcript = Transcript::create(temp.path(), "run-abc123").expect("create");

        let mut state = ExecutionState::new();
        let entry = state
            .record_execution(
                Step {
                    step: "print".to_string(),
                    command: "echo hi".to_string(),
                    reason: "test".to_string(),
                    timeout_secs: Some(5),
                    completed: true,
                },
                ValidationOutcome::approve("ok"),
                "echo hi".to_string(),
                ExecutionResult::new("hi", 0),
            )
            .clone();

        let entry_path = transcript.write_entry(&entry).expect("entry");
        assert!(entry_path.ends_with(Path::new("run-abc123/1.json")));
        let raw = fs::read_to_string(&entry_path).expect("read");
        assert!(raw.ends_with('\n'));
        let decoded: HistoryEntry = serde_json::from_str(&raw).expect("decode");
        assert_eq!(decoded, entry);

        let state_path = transcript.write_state(&state).expect("state");
        let decoded: ExecutionState =
            serde_json::from_str(&fs::read_to_string(state_path).expect("read")).expect("decode");
        assert!(decoded.is_completed());
    }
}
