//! Executor for tools that emit a JSON event stream (`claude-code`).

use std::process::Command;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, instrument};

use super::{ExecRequest, Executor, SignalCollector, finish_stream, spawn_failure};
use crate::cancel::CancelToken;
use crate::core::types::ExecutorResult;
use crate::io::process;

/// Removed from the child environment; the CLI authenticates on its own.
const STRIPPED_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Clone)]
pub struct StreamJsonExecutor {
    program: String,
    error_patterns: Vec<String>,
}

impl StreamJsonExecutor {
    pub fn new(error_patterns: Vec<String>) -> Self {
        Self::with_program("claude", error_patterns)
    }

    /// Use a different binary speaking the same protocol.
    pub fn with_program(program: impl Into<String>, error_patterns: Vec<String>) -> Self {
        Self {
            program: program.into(),
            error_patterns,
        }
    }

    fn command(&self, request: &ExecRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--dangerously-skip-permissions")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        cmd.args(&request.args)
            .arg("-p")
            .arg(&request.prompt)
            .current_dir(&request.workdir)
            .env_remove(STRIPPED_ENV);
        cmd
    }
}

impl Executor for StreamJsonExecutor {
    #[instrument(skip_all, fields(program = %self.program, model = ?request.model))]
    fn run(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecutorResult> {
        cancel.check()?;
        info!("starting stream-json executor");
        let (mut child, reader) = match process::spawn_merged(self.command(request)) {
            Ok(spawned) => spawned,
            Err(err) => return Ok(spawn_failure(&self.program, &err)),
        };

        let mut collector = SignalCollector::new(request.sandbox.clone());
        let outcome = process::stream_lines(&mut child, reader, cancel, |line| {
            if line.trim().is_empty() {
                return;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(event) if event.is_object() => collector.push(&extract_text(&event)),
                // Startup banners and other non-event lines pass through as-is.
                _ => collector.push(line),
            }
        })?;

        Ok(finish_stream(collector, outcome, &self.error_patterns))
    }
}

/// Extract the assistant text carried by one stream event.
///
/// - `assistant`: concatenated text blocks of `message.content`
/// - `content_block_delta`: `delta.text` for `text_delta` deltas
/// - `message_stop`: first text block of `message.content`
/// - `result`: the `output` field when `result` is an object; string results
///   repeat already-streamed text and are skipped
pub fn extract_text(event: &Value) -> String {
    let content_blocks = || {
        event
            .pointer("/message/content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
    };

    match event.get("type").and_then(Value::as_str).unwrap_or_default() {
        "assistant" => content_blocks()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect(),
        "content_block_delta" => {
            let is_text = event.pointer("/delta/type").and_then(Value::as_str) == Some("text_delta");
            if is_text {
                text_at(event, "/delta/text")
            } else {
                String::new()
            }
        }
        "message_stop" => content_blocks()
            .next()
            .map(|block| text_at(block, "/text"))
            .unwrap_or_default(),
        "result" => match event.get("result") {
            Some(Value::Object(_)) => text_at(event, "/result/output"),
            _ => String::new(),
        },
        _ => String::new(),
    }
}

fn text_at(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
