//! Cleanup of raw shell output before it is recorded or shown to a backend.

use std::sync::LazyLock;

use regex::Regex;

static ANSI_ESCAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap()
});

/// Remove ANSI escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(text, "").into_owned()
}

/// Strip ANSI escapes, trim trailing whitespace per line, and drop empty lines.
///
/// Leading indentation and line order are preserved.
pub fn clean_output(raw: &str) -> String {
    strip_ansi(raw)
        .split('\n')
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode raw bytes lossily and clean them.
pub fn clean_bytes(raw: &[u8]) -> String {
    clean_output(&String::from_utf8_lossy(raw))
}
