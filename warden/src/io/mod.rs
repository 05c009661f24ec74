//! I/O adapters: filesystem layout, persistence, config, and the worker process.

pub mod config;
pub mod git;
pub mod init;
pub mod process;
pub mod prompt;
pub mod repo_config;
pub mod store;
pub mod worker;
