//! Side-effecting operations: subprocesses, files, git, terminal interaction.
//!
//! Each external collaborator sits behind a small trait ([`executor::Executor`],
//! [`git::Repository`], [`interact::Prompter`]) so the engine can be driven by
//! scripted doubles in tests.

pub mod agents;
pub mod config;
pub mod doctor;
pub mod executor;
pub mod git;
pub mod interact;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod session;
pub mod stores;
