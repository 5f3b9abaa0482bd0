//! Pipeline orchestration for AI coding agents.
//!
//! A pipeline is a tree of steps (agent invocations, shell commands, human
//! gates, and loops) declared in `.pilot/pipeline.toml`. Agents steer the run
//! by embedding `<pilot:*>` signal tags in their output; the engine reacts by
//! retrying, iterating over task files, or repeating review rounds until an
//! approval arrives.
//!
//! - **[`core`]**: Pure logic (step model, signal grammar, feedback, sandbox).
//! - **[`io`]**: Side effects (executors, session state, stores, git, prompts).
//! - **[`engine`]**: The step/loop state machine tying both together.
//!
//! Progress is persisted after every step so an interrupted run can resume,
//! and a shared [`cancel::CancelToken`] stops the run (and any running
//! subprocess group) promptly.

pub mod cancel;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
