//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures (and caller-supplied clocks) and return deterministic
//! outputs suitable for tests.

pub mod backoff;
pub mod breaker;
pub mod denylist;
pub mod pipeline;
pub mod plan;
pub mod preflight;
pub mod secrets;
pub mod types;
