//! Iterator and convergence loops.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::Engine;
use crate::core::feedback::FeedbackLog;
use crate::core::runtime::LoopVars;
use crate::core::signals::SignalKind;
use crate::core::types::{LoopStep, SortOrder, Step};
use crate::error::PipelineError;
use crate::io::git::diff_command;
use crate::io::prompt::expand;

/// Loop variable holding accumulated reviewer feedback.
pub const FEEDBACK_VAR: &str = "FEEDBACK";
const COMPLETED_DIR: &str = "completed";

impl Engine {
    /// Run the children once per `*.md` file in the source directory.
    ///
    /// A child that signals `skip` ends the item early and leaves its file in
    /// place; every other item is moved to `<source>/completed/` afterwards.
    pub(super) fn run_iterator(
        &mut self,
        step: &LoopStep,
        over: &str,
        var: &str,
        order: SortOrder,
        parent: &LoopVars,
    ) -> Result<()> {
        let source = expand(over, &self.config, &self.runtime, parent);
        let dir = self.runtime.config_dir.join(source.trim());
        let files = list_task_files(&dir, order)?;
        let total = files.len();
        self.progress
            .log(&format!("▸ {} (loop) — {total} items", step.id));

        for (index, path) in files.iter().enumerate() {
            self.cancel.check()?;
            if index > 0 {
                self.pause()?;
            }
            let content = fs::read_to_string(path)
                .with_context(|| format!("read task {}", path.display()))?;
            let mut vars = parent.clone();
            vars.insert(var.to_string(), content);

            let name = display_name(path);
            self.progress
                .log(&format!("  [{}/{total}] {name}", index + 1));

            if self.run_item(&step.steps, &vars)? {
                self.progress.log(&format!("  ⤳ skipping {name}"));
                continue;
            }
            move_to_completed(&dir, path)?;
        }
        Ok(())
    }

    /// Returns `true` when a child asked to skip the item.
    fn run_item(&mut self, children: &[Step], vars: &LoopVars) -> Result<bool> {
        for child in children {
            if let Some(result) = self.run_step(child, vars)?
                && result.has_signal(SignalKind::Skip)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Repeat the children until `until` is signalled, the repository stops
    /// changing, or `max_rounds` is exhausted. Round and diff command are
    /// restored whatever the outcome.
    pub(super) fn run_convergence(
        &mut self,
        step: &LoopStep,
        until: SignalKind,
        max_rounds: u32,
        parent: &LoopVars,
    ) -> Result<()> {
        let saved_round = self.runtime.round;
        let saved_diff = self.runtime.diff_command.clone();
        let result = self.converge(step, until, max_rounds, parent);
        self.runtime.round = saved_round;
        self.runtime.diff_command = saved_diff;
        result
    }

    fn converge(
        &mut self,
        step: &LoopStep,
        until: SignalKind,
        max_rounds: u32,
        parent: &LoopVars,
    ) -> Result<()> {
        let mut feedback = FeedbackLog::new();
        for round in 1..=max_rounds {
            self.cancel.check()?;
            if round > 1 {
                self.pause()?;
            }
            self.runtime.round = round;
            self.runtime.diff_command = diff_command(&self.runtime.default_branch);

            let mut vars = parent.clone();
            if let Some(text) = feedback.render() {
                vars.insert(FEEDBACK_VAR.to_string(), text);
            }
            self.progress
                .log(&format!("  round {round}/{max_rounds}"));

            let head_before = self.repository.head_marker();
            let mut rejected = false;
            for child in &step.steps {
                let Some(result) = self.run_step(child, &vars)? else {
                    continue;
                };
                if result.has_signal(until) {
                    let verb = match until {
                        SignalKind::Approve => "approved",
                        other => other.as_str(),
                    };
                    self.progress
                        .log(&format!("  ✓ {verb} at round {round}"));
                    return Ok(());
                }
                if let Some(text) = result.last_reject() {
                    feedback.record(round, text);
                    self.stores.save_review(&step.id, round, text)?;
                    if let Some(rendered) = feedback.render() {
                        vars.insert(FEEDBACK_VAR.to_string(), rendered);
                    }
                    rejected = true;
                }
            }

            let head_after = self.repository.head_marker();
            debug!(round, ?head_before, ?head_after, rejected, "round finished");
            if !rejected && head_before.is_some() && head_before == head_after {
                self.progress
                    .log(&format!("  ✓ converged at round {round} (no new commits)"));
                return Ok(());
            }
        }
        Err(PipelineError::MaxRounds {
            step: step.id.clone(),
            max_rounds,
        }
        .into())
    }
}

/// `*.md` files directly inside `dir`, sorted by name. A missing directory
/// has no tasks.
fn list_task_files(dir: &Path, order: SortOrder) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "task directory missing");
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read dir entry in {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "md") {
            files.push(path);
        }
    }
    files.sort();
    if order == SortOrder::Desc {
        files.reverse();
    }
    Ok(files)
}

fn move_to_completed(dir: &Path, path: &Path) -> Result<()> {
    let completed = dir.join(COMPLETED_DIR);
    fs::create_dir_all(&completed)
        .with_context(|| format!("create directory {}", completed.display()))?;
    let target = completed.join(path.file_name().unwrap_or_default());
    fs::rename(path, &target)
        .with_context(|| format!("move {} to {}", path.display(), target.display()))?;
    debug!(target = %target.display(), "task completed");
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_files_are_sorted_and_filtered() {
        let temp = tempfile::tempdir().expect("tempdir");
        for name in ["b.md", "a.md", "notes.txt", "c.md"] {
            fs::write(temp.path().join(name), name).expect("write");
        }
        fs::create_dir(temp.path().join("sub.md")).expect("mkdir");

        let names = |order| {
            list_task_files(temp.path(), order)
                .expect("list")
                .iter()
                .map(|path| display_name(path))
                .collect::<Vec<_>>()
        };
        assert_eq!(names(SortOrder::Asc), vec!["a.md", "b.md", "c.md"]);
        assert_eq!(names(SortOrder::Desc), vec!["c.md", "b.md", "a.md"]);
    }

    #[test]
    fn missing_task_dir_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = list_task_files(&temp.path().join("nope"), SortOrder::Asc).expect("list");
        assert!(files.is_empty());
    }

    #[test]
    fn finished_task_moves_into_completed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = temp.path().join("01.md");
        fs::write(&task, "do it").expect("write");
        move_to_completed(temp.path(), &task).expect("move");
        assert!(!task.exists());
        assert_eq!(
            fs::read_to_string(temp.path().join("completed/01.md")).expect("read"),
            "do it"
        );
    }
}
