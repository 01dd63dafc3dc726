//! Natural-language task execution in a persistent shell.
//!
//! A planner proposes one shell command at a time, a validator approves,
//! rejects, or rewrites it, and approved commands run in a single long-lived
//! interactive shell so that state carries over between steps.
//!
//! - **[`core`]**: Pure logic (framing, output cleanup, response parsing, data model).
//! - **[`io`]**: The shell session, backend processes, config, and transcripts.
//!
//! [`controller`] ties them together into the propose → validate → execute loop.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
