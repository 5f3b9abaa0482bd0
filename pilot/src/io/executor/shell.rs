//! Executor for shell steps.
//!
//! Output is captured, not streamed, and never scanned for signals.

use std::process::Command;

use anyhow::Result;
use tracing::{debug, instrument};

use super::{ExecRequest, Executor, spawn_failure};
use crate::cancel::CancelToken;
use crate::core::types::ExecutorResult;
use crate::io::process;

#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    fn command(request: &ExecRequest) -> Command {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&request.prompt);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&request.prompt);
            cmd
        };
        cmd.current_dir(&request.workdir);
        cmd
    }
}

impl Executor for ShellExecutor {
    #[instrument(skip_all, fields(command = %request.prompt))]
    fn run(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecutorResult> {
        cancel.check()?;
        let output = match process::run_captured(Self::command(request), cancel) {
            Ok(output) => output,
            Err(err) if crate::error::is_cancelled(&err) => return Err(err),
            Err(err) => {
                let io_err = std::io::Error::other(format!("{err:#}"));
                return Ok(spawn_failure("sh", &io_err));
            }
        };
        let exit_code = process::exit_code(&output.status);
        debug!(exit_code, "shell command finished");
        Ok(ExecutorResult {
            output: output.stdout,
            exit_code,
            error: (exit_code != 0).then_some(output.stderr),
            signals: Vec::new(),
        })
    }
}
