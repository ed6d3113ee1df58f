//! cmdgate: mediates shell commands suggested by a language model.
//!
//! A natural-language request is turned into a suggestion by an inference
//! backend, a single command is extracted from it, validated against a
//! configurable policy, optionally approved by a human, executed with a
//! timeout (or simulated), and every outcome is appended to a SQLite audit
//! log.
//!
//! # Architecture
//!
//! - **[`pipeline`]**: Request orchestration with one audit record per request.
//! - **[`extract`]**: Pull one command line out of free-form model output.
//! - **[`policy`]**: Dangerous patterns, blacklist, whitelist, approval list.
//! - **[`approval`]**: Human-in-the-loop gate (terminal or fixed answer).
//! - **[`exec`]**: Timeout-bounded `sh -c` execution and dry runs.
//! - **[`audit`]**: Append-only SQLite log, filtered queries, statistics.
//! - **[`backend`]**: Mock, passthrough, and local llama.cpp suggestion sources.
//! - **[`config`]**: Embedded defaults merged with the user overlay.
//! - **[`reload`]**: Hot reload into immutable snapshots.
//! - **[`queue`]**: File-based trigger queue and its submission bridge.
//! - **[`logging`]**: Terminal and file logger setup.

/// Approval gate trait and implementations.
pub mod approval;
/// SQLite audit log, records, and reporting queries.
pub mod audit;
/// Inference backends producing suggestions.
pub mod backend;
/// Configuration types, loading, and overlay merge logic.
pub mod config;
/// Command execution with timeout.
pub mod exec;
/// Command extraction from model output.
pub mod extract;
/// Logger initialisation.
pub mod logging;
/// The request pipeline.
pub mod pipeline;
/// Validation policy.
pub mod policy;
/// Trigger directory queue.
pub mod queue;
/// Configuration hot reload.
pub mod reload;

use policy::{PolicyStore, Verdict};

/// Build the policy from default config and validate a command string.
///
/// This is the main entry point for tests and simple usage.
/// For user config or hot reload, go through [`reload::ConfigWatcher`].
pub fn validate(command: &str) -> Verdict {
    let config = config::Config::default_config();
    PolicyStore::from_config(&config.security).validate(command)
}
