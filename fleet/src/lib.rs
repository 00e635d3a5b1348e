//! Fleet-wide agent orchestration engine.
//!
//! Distributes repositories to a bounded pool of workers, gates each one
//! through safety preflight checks, drives an external agent through a
//! Plan → Validate → Execute lifecycle, and keeps exclusive authority over
//! every git or network mutation. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (preflight verdicts, plan parsing,
//!   denylist matching, backoff arithmetic, circuit breaker, pipeline
//!   transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem leases, git, child
//!   processes, agent sessions, persisted state).
//!
//! Orchestration modules ([`preflight`], [`guardrails`], [`governor`],
//! [`pipeline`], [`worker`], [`run`]) combine the two to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod governor;
pub mod guardrails;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod preflight;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
