//! Stable exit codes for `fleet` commands (automation contract).

/// Every repository completed (or was safely skipped).
pub const OK: i32 = 0;
/// Some repositories failed, or the run aborted on a shared-resource failure.
pub const PARTIAL_FAILURE: i32 = 1;
/// Guardrail/validation rejections were the only failures and nothing completed.
pub const VALIDATION_REJECTED: i32 = 2;
/// A required external tool (git, tmux, agent) is missing.
pub const DEPENDENCY_MISSING: i32 = 3;
/// Invalid invocation arguments or configuration.
pub const INVALID_ARGS: i32 = 4;
/// The run was interrupted and can be continued with `--resume`.
pub const INTERRUPTED: i32 = 5;
