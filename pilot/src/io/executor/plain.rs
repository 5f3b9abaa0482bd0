//! Executor for CLIs that print plain text (`T [--model M] [ARGS…] -p PROMPT`).

use std::process::Command;

use anyhow::Result;
use tracing::{info, instrument};

use super::{ExecRequest, Executor, SignalCollector, finish_stream, spawn_failure};
use crate::cancel::CancelToken;
use crate::core::types::ExecutorResult;
use crate::io::process;

#[derive(Debug, Clone)]
pub struct PlainExecutor {
    tool: String,
    error_patterns: Vec<String>,
}

impl PlainExecutor {
    pub fn new(tool: impl Into<String>, error_patterns: Vec<String>) -> Self {
        Self {
            tool: tool.into(),
            error_patterns,
        }
    }

    fn command(&self, request: &ExecRequest) -> Command {
        let mut cmd = Command::new(&self.tool);
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        cmd.args(&request.args)
            .arg("-p")
            .arg(&request.prompt)
            .current_dir(&request.workdir);
        cmd
    }
}

impl Executor for PlainExecutor {
    #[instrument(skip_all, fields(tool = %self.tool, model = ?request.model))]
    fn run(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecutorResult> {
        cancel.check()?;
        info!("starting plain executor");
        let (mut child, reader) = match process::spawn_merged(self.command(request)) {
            Ok(spawned) => spawned,
            Err(err) => return Ok(spawn_failure(&self.tool, &err)),
        };
        let mut collector = SignalCollector::new(request.sandbox.clone());
        let outcome = process::stream_lines(&mut child, reader, cancel, |line| collector.push(line))?;
        Ok(finish_stream(collector, outcome, &self.error_patterns))
    }
}
