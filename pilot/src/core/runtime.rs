//! Mutable per-run context shared by the engine and template expansion.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::types::QaPair;

/// Variables injected by enclosing loops (`{{TASK}}`, `{{FEEDBACK}}`, ...).
pub type LoopVars = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeContext {
    /// Workspace root; child processes run here.
    pub project_dir: PathBuf,
    /// Directory holding the pipeline file; prompt and task paths resolve here.
    pub config_dir: PathBuf,
    /// Session artifacts (`session.json`, emissions, Q&A, reviews, logs).
    pub session_dir: PathBuf,
    pub default_branch: String,
    pub progress_path: PathBuf,
    /// Command reviewers use to inspect changes (`{{diff}}`).
    pub diff_command: String,
    /// Current convergence round, 0 outside convergence loops.
    pub round: u32,
    pub emissions: BTreeMap<String, String>,
    pub questions: Vec<QaPair>,
    /// Debug snapshot width; `Some(0)` disables truncation, `None` disables snapshots.
    pub debug: Option<usize>,
}
