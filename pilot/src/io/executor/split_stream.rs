//! Executor for tools that answer on stdout and report progress on stderr
//! (`codex`).
//!
//! stdout is captured in full and is the result. stderr is filtered on a
//! background thread into a short progress display: the header block between
//! the first two `--------` separators plus `**bold**` summary lines.

use std::collections::{HashSet, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::process::Command;
use std::thread;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use super::{ExecRequest, Executor, check_error_patterns, spawn_failure};
use crate::cancel::CancelToken;
use crate::core::signals::parse_signals;
use crate::core::types::ExecutorResult;
use crate::io::process;

pub const DEFAULT_MODEL: &str = "gpt-5.3-codex";
const TAIL_LINES: usize = 5;
const TAIL_LINE_CHARS: usize = 256;
const SEPARATOR: &str = "--------";

#[derive(Debug, Clone)]
pub struct SplitStreamExecutor {
    program: String,
    error_patterns: Vec<String>,
}

impl SplitStreamExecutor {
    pub fn new(error_patterns: Vec<String>) -> Self {
        Self::with_program("codex", error_patterns)
    }

    pub fn with_program(program: impl Into<String>, error_patterns: Vec<String>) -> Self {
        Self {
            program: program.into(),
            error_patterns,
        }
    }

    fn command(&self, request: &ExecRequest) -> Command {
        let model = request.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let mut cmd = Command::new(&self.program);
        cmd.arg("exec")
            .arg("--sandbox")
            .arg(sandbox_mode())
            .arg("--skip-git-repo-check")
            .arg("-c")
            .arg(format!("model=\"{model}\""))
            .arg("-c")
            .arg("model_reasoning_effort=xhigh")
            .arg("-c")
            .arg("stream_idle_timeout_ms=3600000")
            .args(&request.args)
            .arg(&request.prompt)
            .current_dir(&request.workdir);
        cmd
    }
}

/// Landlock is unavailable in containers, so `PILOT_DOCKER=1` disables the
/// tool's own sandbox.
fn sandbox_mode() -> &'static str {
    match std::env::var("PILOT_DOCKER") {
        Ok(value) if value == "1" => "danger-full-access",
        _ => "workspace-write",
    }
}

impl Executor for SplitStreamExecutor {
    #[instrument(skip_all, fields(program = %self.program, model = ?request.model))]
    fn run(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecutorResult> {
        cancel.check()?;
        info!("starting split-stream executor");
        let mut child = match process::spawn_piped(self.command(request)) {
            Ok(child) => child,
            Err(err) => return Ok(spawn_failure(&self.program, &err)),
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let stderr_handle = thread::spawn(move || filter_stderr(stderr));
        let stdout_handle = process::read_all_in_background(stdout);

        let status = process::wait_cancellable(&mut child, cancel)?;
        let joined = process::join_cancellable(stdout_handle, &mut child, cancel)?;
        let (output, stdout_error) = match process::join_output(joined) {
            Ok(output) => (output, None),
            Err(err) => (String::new(), Some(format!("{err:#}"))),
        };
        let stderr_summary = process::join_cancellable(stderr_handle, &mut child, cancel)?
            .unwrap_or_else(|_| StderrSummary {
                tail: Vec::new(),
                error: Some("stderr reader thread panicked".to_string()),
            });

        let exit_code = process::exit_code(&status);
        let error = if let Some(pattern) = check_error_patterns(&output, &self.error_patterns) {
            Some(format!("detected error pattern: {pattern}"))
        } else if let Some(err) = stderr_summary.error {
            Some(err)
        } else if let Some(err) = stdout_error {
            Some(err)
        } else if exit_code != 0 {
            let mut message = format!("{} exited with code {exit_code}", self.program);
            if !stderr_summary.tail.is_empty() {
                message.push_str("\nstderr: ");
                message.push_str(&stderr_summary.tail.join("\n"));
            }
            Some(message)
        } else {
            None
        };
        if let Some(err) = &error {
            warn!(exit_code, err = %err, "split-stream executor failed");
        }

        let signals = parse_signals(&output);
        Ok(ExecutorResult {
            output,
            exit_code,
            error,
            signals,
        })
    }
}

#[derive(Debug)]
struct StderrSummary {
    tail: Vec<String>,
    error: Option<String>,
}

fn filter_stderr<R: Read>(stderr: R) -> StderrSummary {
    let mut filter = StderrFilter::default();
    let mut error = None;
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) => {
                if let Some(shown) = filter.feed(&line) {
                    println!("{shown}");
                }
            }
            Err(err) => {
                error = Some(err.to_string());
                break;
            }
        }
    }
    StderrSummary {
        tail: filter.tail.into_iter().collect(),
        error,
    }
}

/// Progress-display filter for stderr lines.
#[derive(Debug, Default)]
pub struct StderrFilter {
    separators: usize,
    seen: HashSet<String>,
    tail: VecDeque<String>,
}

impl StderrFilter {
    /// Consume one line; returns the text to display, if any.
    pub fn feed(&mut self, line: &str) -> Option<String> {
        let stripped = line.trim();
        if stripped.is_empty() {
            return None;
        }
        self.remember(stripped);

        if stripped.starts_with(SEPARATOR) {
            self.separators += 1;
            return (self.separators <= 2).then(|| line.trim_end().to_string());
        }
        let shown = if self.separators == 1 {
            line.trim_end().to_string()
        } else if stripped.starts_with("**") {
            strip_bold(stripped)
        } else {
            return None;
        };
        self.seen.insert(shown.clone()).then_some(shown)
    }

    pub fn tail(&self) -> impl Iterator<Item = &str> {
        self.tail.iter().map(String::as_str)
    }

    fn remember(&mut self, stripped: &str) {
        let stored = if stripped.chars().count() > TAIL_LINE_CHARS {
            let cut: String = stripped.chars().take(TAIL_LINE_CHARS).collect();
            format!("{cut}...")
        } else {
            stripped.to_string()
        };
        self.tail.push_back(stored);
        if self.tail.len() > TAIL_LINES {
            self.tail.pop_front();
        }
    }
}

/// Remove paired `**` markers; an unpaired trailing `**` is kept.
pub fn strip_bold(text: &str) -> String {
    let mut result = text.to_string();
    while let Some(start) = result.find("**") {
        let Some(len) = result[start + 2..].find("**") else {
            break;
        };
        let end = start + 2 + len;
        result.replace_range(end..end + 2, "");
        result.replace_range(start..start + 2, "");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_bold_removes_pairs_only() {
        assert_eq!(strip_bold("**Plan** ready"), "Plan ready");
        assert_eq!(strip_bold("**a** and **b**"), "a and b");
        assert_eq!(strip_bold("**dangling"), "**dangling");
    }

    #[test]
    fn filter_shows_header_block_and_bold_lines() {
        let mut filter = StderrFilter::default();
        let lines = [
            "--------",
            "model: gpt",
            "",
            "--------",
            "thinking about it",
            "**Reading files**",
            "**Reading files**",
            "--------",
            "workdir: /tmp",
        ];
        let shown: Vec<String> = lines.iter().filter_map(|line| filter.feed(line)).collect();
        assert_eq!(
            shown,
            vec!["--------", "model: gpt", "--------", "Reading files"]
        );
    }

    #[test]
    fn separators_are_never_deduplicated() {
        let mut filter = StderrFilter::default();
        assert!(filter.feed("--------").is_some());
        assert!(filter.feed("--------").is_some());
        assert!(filter.feed("--------").is_none());
    }

    #[test]
    fn tail_keeps_last_five_truncated_lines() {
        let mut filter = StderrFilter::default();
        for i in 0..7 {
            filter.feed(&format!("line {i}"));
        }
        filter.feed(&"x".repeat(300));
        let tail: Vec<&str> = filter.tail().collect();
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[0], "line 3");
        assert_eq!(tail[4].len(), 259);
        assert!(tail[4].ends_with("..."));
    }

    #[test]
    fn command_defaults_model() {
        let executor = SplitStreamExecutor::new(Vec::new());
        let request = ExecRequest {
            prompt: "fix".to_string(),
            ..ExecRequest::default()
        };
        let args: Vec<String> = executor
            .command(&request)
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "exec");
        assert!(args.contains(&format!("model=\"{DEFAULT_MODEL}\"")));
        assert_eq!(args.last().map(String::as_str), Some("fix"));
    }
}
