//! Stable exit codes for shellpilot CLI commands.

/// Command succeeded; for `run`, the task completed.
pub const OK: i32 = 0;
/// Invalid config, backend failure, shell startup failure, or any other fatal error.
pub const INVALID: i32 = 1;
/// `shellpilot run` hit the iteration limit before the task completed.
pub const INCOMPLETE: i32 = 2;
