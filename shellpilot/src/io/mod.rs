//! Side-effecting operations: the shell process, backends, and files.
//!
//! Everything here touches the operating system. Keeping it out of
//! [`crate::core`] lets the loop be tested with scripted doubles.

pub mod backend;
pub mod chat;
pub mod config;
pub mod process;
pub mod prompt;
pub mod shell;
pub mod transcript;
