//! I/O adapters: filesystem state, git, child processes, agent sessions.

pub mod atomic;
pub mod audit;
pub mod backoff_store;
pub mod config;
pub mod git;
pub mod ledger;
pub mod lock;
pub mod process;
pub mod prompt;
pub mod queue;
pub mod run_state;
pub mod secret_scan;
pub mod session;
pub mod signals;
