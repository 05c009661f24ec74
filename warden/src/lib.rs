//! Resilience and scheduling core for an autonomous worker supervisor.
//!
//! A worker process (typically an AI coding agent) is run in loops against a
//! working directory. Warden decides whether each loop may start, classifies
//! failures, chooses a retry strategy, and schedules many such jobs across
//! repos in dependency order. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, backoff, breaker
//!   transitions, graph ordering). Time is passed in; no I/O.
//! - **[`io`]**: Side effects (filesystem layout, state persistence, git, the
//!   worker process). Behind traits so tests can script them.
//!
//! [`retry`], [`circuit`], [`supervise`] and [`orchestrate`] combine the two
//! to implement the CLI commands.

pub mod circuit;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrate;
pub mod retry;
pub mod supervise;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
