//! Executor abstraction for agent and shell invocation.
//!
//! The [`Executor`] trait decouples step orchestration from the transport
//! conventions of each tool. One implementation exists per convention:
//!
//! - [`stream_json`]: structured JSON event stream (`claude-code`)
//! - [`split_stream`]: result on stdout, progress on stderr (`codex`)
//! - [`plain`]: any other CLI taking `-p PROMPT`
//! - [`script`]: user script reading the prompt from a temp file (`custom`)
//! - [`shell`]: `sh -c COMMAND` for shell steps
//!
//! Ordinary tool failures (non-zero exit, spawn failure, error-pattern match)
//! are reported on the returned [`ExecutorResult`]. The only `Err` an
//! executor returns is cancellation. Tests use scripted executors that return
//! predetermined results without spawning processes.

pub mod plain;
pub mod pool;
pub mod script;
pub mod shell;
pub mod split_stream;
pub mod stream_json;

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitStatus;

use anyhow::Result;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::core::sandbox::Sandbox;
use crate::core::signals::{Signal, parse_signals};
use crate::core::types::ExecutorResult;
use crate::io::process::{self, StreamOutcome};

pub use pool::ExecutorPool;

/// Parameters for one executor invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Working directory for the child process; relative update paths resolve here.
    pub workdir: PathBuf,
    /// Prompt text (agent steps) or command line (shell steps).
    pub prompt: String,
    pub model: Option<String>,
    /// Extra arguments inserted before the prompt.
    pub args: Vec<String>,
    /// When set, `update` signals inside the sandbox are written as they stream.
    pub sandbox: Option<Sandbox>,
}

/// Abstraction over agent execution backends.
pub trait Executor: Send + Sync {
    fn run(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecutorResult>;
}

/// Accumulates streamed output, echoes it to the terminal, and acts on
/// `update` signals as soon as their closing tag has arrived.
#[derive(Debug)]
pub struct SignalCollector {
    output: String,
    sandbox: Option<Sandbox>,
    updates_written: usize,
    echo: bool,
}

impl SignalCollector {
    pub fn new(sandbox: Option<Sandbox>) -> Self {
        Self {
            output: String::new(),
            sandbox,
            updates_written: 0,
            echo: true,
        }
    }

    /// Disable terminal echo (used by tests and quiet callers).
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        if self.echo {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(chunk.as_bytes());
            let _ = stdout.flush();
        }
        self.output.push_str(chunk);
        if chunk.contains("</pilot:update>") {
            self.write_new_updates();
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    fn write_new_updates(&mut self) {
        let updates: Vec<Signal> = parse_signals(&self.output)
            .into_iter()
            .filter(|signal| matches!(signal, Signal::Update { .. }))
            .collect();
        for signal in updates.iter().skip(self.updates_written) {
            if let Signal::Update { path, content } = signal {
                write_update(self.sandbox.as_ref(), path, content);
            }
        }
        self.updates_written = updates.len();
    }

    /// Build the final result from the accumulated output.
    pub fn finish(self, exit_code: i32, error: Option<String>) -> ExecutorResult {
        let signals = parse_signals(&self.output);
        ExecutorResult {
            output: self.output,
            exit_code,
            error,
            signals,
        }
    }
}

fn write_update(sandbox: Option<&Sandbox>, path: &str, content: &str) {
    let Some(sandbox) = sandbox else {
        return;
    };
    // Escaping paths are left for the engine, which fails the run.
    let Ok(target) = sandbox.resolve_update(path) else {
        warn!(path, "update outside sandbox not written");
        return;
    };
    if let Some(parent) = target.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        warn!(path = %parent.display(), err = %err, "create update dir failed");
        return;
    }
    match fs::write(&target, content) {
        Ok(()) => debug!(path = %target.display(), "wrote update"),
        Err(err) => warn!(path = %target.display(), err = %err, "write update failed"),
    }
}

/// Case-insensitive substring search for configured error phrases.
///
/// Blank patterns are ignored. Returns the first matching pattern as written.
pub fn check_error_patterns<'a>(output: &str, patterns: &'a [String]) -> Option<&'a str> {
    let haystack = output.to_lowercase();
    patterns
        .iter()
        .filter(|pattern| !pattern.trim().is_empty())
        .find(|pattern| haystack.contains(&pattern.to_lowercase()))
        .map(String::as_str)
}

/// Result for a child that could not be started.
pub fn spawn_failure(program: &str, err: &std::io::Error) -> ExecutorResult {
    ExecutorResult::failure(format!("failed to start {program}: {err}"))
}

/// Error text for a finished streaming child: error pattern first, then read
/// failure, then non-zero exit.
pub fn stream_error(
    output: &str,
    patterns: &[String],
    status: &ExitStatus,
    read_error: Option<String>,
) -> Option<String> {
    if let Some(pattern) = check_error_patterns(output, patterns) {
        return Some(format!("detected error pattern: {pattern}"));
    }
    if let Some(err) = read_error {
        return Some(format!("read output: {err}"));
    }
    let code = process::exit_code(status);
    (code != 0).then(|| format!("exit code {code}"))
}

/// Shared tail of the merged-stream executors.
pub fn finish_stream(
    collector: SignalCollector,
    outcome: StreamOutcome,
    patterns: &[String],
) -> ExecutorResult {
    let exit_code = process::exit_code(&outcome.status);
    let error = stream_error(
        collector.output(),
        patterns,
        &outcome.status,
        outcome.read_error,
    );
    debug!(exit_code, error = ?error, "executor finished");
    collector.finish(exit_code, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_patterns_match_case_insensitively() {
        let patterns = vec![" ".to_string(), "Rate Limit".to_string()];
        assert_eq!(
            check_error_patterns("error: RATE LIMIT exceeded", &patterns),
            Some("Rate Limit")
        );
        assert_eq!(check_error_patterns("all good", &patterns), None);
    }

    #[test]
    fn blank_patterns_never_match() {
        let patterns = vec![String::new(), "   ".to_string()];
        assert_eq!(check_error_patterns("anything", &patterns), None);
    }

    #[test]
    fn collector_writes_updates_inside_sandbox_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = Sandbox::new(temp.path(), ".pilot");
        let mut collector = SignalCollector::new(Some(sandbox)).quiet();
        collector.push("<pilot:update path=\".pilot/notes.md\">first");
        collector.push(" line\n</pilot:update>\n");
        collector.push("<pilot:update path=\"../escape.md\">x</pilot:update>\n");

        let written = fs::read_to_string(temp.path().join(".pilot/notes.md")).expect("read");
        assert_eq!(written, "first line\n");
        assert!(!temp.path().join("../escape.md").exists());

        fs::write(temp.path().join(".pilot/notes.md"), "edited").expect("write");
        collector.push("trailing </pilot:update> noise\n");
        let unchanged = fs::read_to_string(temp.path().join(".pilot/notes.md")).expect("read");
        assert_eq!(unchanged, "edited");

        let result = collector.finish(0, None);
        assert_eq!(result.signals.len(), 2);
    }

    #[test]
    fn collector_without_sandbox_only_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut collector = SignalCollector::new(None).quiet();
        collector.push("<pilot:update path=\"a.md\">x</pilot:update>");
        let result = collector.finish(0, None);
        assert!(!temp.path().join("a.md").exists());
        assert_eq!(
            result.signals,
            vec![Signal::Update {
                path: "a.md".to_string(),
                content: "x".to_string()
            }]
        );
    }
}
