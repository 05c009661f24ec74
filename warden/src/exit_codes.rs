//! Stable exit codes for warden CLI commands.

/// Command succeeded; for `run`, the worker signalled completion.
pub const OK: i32 = 0;
/// Invalid config, repo declaration, dependency graph, or any other error.
pub const INVALID: i32 = 1;
/// `orchestrate run` finished with repos blocked or still waiting.
pub const BLOCKED: i32 = 2;
/// `run` stopped because the circuit breaker is open.
pub const CIRCUIT_OPEN: i32 = 3;
/// `run` stopped on an escalated failure or an exhausted loop budget.
pub const HALTED: i32 = 4;
