//! Deterministic, pure logic shared by the shell engine and the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod framing;
pub mod output;
pub mod response;
pub mod types;
