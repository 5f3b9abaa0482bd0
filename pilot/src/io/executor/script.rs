//! Executor for user-supplied scripts (`tool = "custom"`).
//!
//! The prompt is written to a temp file whose path is passed as the last
//! argument: `SCRIPT [ARGS…] PROMPT_FILE`. The file is removed when the
//! handle drops, on success, failure, and cancellation alike.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{info, instrument, warn};

use super::{ExecRequest, Executor, SignalCollector, finish_stream, spawn_failure};
use crate::cancel::CancelToken;
use crate::core::types::ExecutorResult;
use crate::io::process;

#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    script: PathBuf,
    error_patterns: Vec<String>,
    /// Where prompt files are created; the system temp dir when unset.
    prompt_dir: Option<PathBuf>,
}

impl ScriptExecutor {
    pub fn new(script: impl Into<PathBuf>, error_patterns: Vec<String>) -> Self {
        Self {
            script: script.into(),
            error_patterns,
            prompt_dir: None,
        }
    }

    pub fn with_prompt_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompt_dir = Some(dir.into());
        self
    }
}

impl Executor for ScriptExecutor {
    #[instrument(skip_all, fields(script = %self.script.display()))]
    fn run(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecutorResult> {
        cancel.check()?;
        let prompt_file = match write_prompt_file(&request.prompt, self.prompt_dir.as_deref()) {
            Ok(file) => file,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "prompt file setup failed");
                return Ok(ExecutorResult::failure(format!("{err:#}")));
            }
        };
        info!(prompt_file = %prompt_file.path().display(), "starting script executor");

        let mut cmd = Command::new(&self.script);
        cmd.args(&request.args)
            .arg(prompt_file.path())
            .current_dir(&request.workdir);

        let (mut child, reader) = match process::spawn_merged(cmd) {
            Ok(spawned) => spawned,
            Err(err) => {
                return Ok(spawn_failure(&self.script.display().to_string(), &err));
            }
        };
        let mut collector = SignalCollector::new(request.sandbox.clone());
        let outcome = process::stream_lines(&mut child, reader, cancel, |line| collector.push(line))?;
        Ok(finish_stream(collector, outcome, &self.error_patterns))
    }
}

fn write_prompt_file(prompt: &str, dir: Option<&Path>) -> Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("pilot-prompt-").suffix(".txt");
    let mut file = match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .context("create prompt file")?;
    file.write_all(prompt.as_bytes())
        .and_then(|()| file.flush())
        .context("write prompt file")?;
    Ok(file)
}
