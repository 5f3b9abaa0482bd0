//! Executors against real child processes (`sh` scripts standing in for the
//! agent CLIs).
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use pilot::cancel::CancelToken;
use pilot::core::sandbox::Sandbox;
use pilot::core::signals::{Signal, SignalKind};
use pilot::error::is_cancelled;
use pilot::io::executor::plain::PlainExecutor;
use pilot::io::executor::script::ScriptExecutor;
use pilot::io::executor::shell::ShellExecutor;
use pilot::io::executor::split_stream::SplitStreamExecutor;
use pilot::io::executor::stream_json::StreamJsonExecutor;
use pilot::io::executor::{ExecRequest, Executor};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn request(workdir: &Path, prompt: &str) -> ExecRequest {
    ExecRequest {
        workdir: workdir.to_path_buf(),
        prompt: prompt.to_string(),
        ..ExecRequest::default()
    }
}

#[test]
fn script_reads_prompt_file_and_signals_are_parsed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        temp.path(),
        "agent.sh",
        r#"echo "file=$1"
echo "prompt=$(cat "$1")"
echo '<pilot:emit key="plan">step 1</pilot:emit>'
echo '<pilot:approve/>'
"#,
    );
    let executor = ScriptExecutor::new(&script, Vec::new());

    let result = executor
        .run(&request(temp.path(), "build it"), &CancelToken::new())
        .expect("run");

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.error, None);
    assert!(result.output.contains("prompt=build it\n"));
    assert!(result.has_signal(SignalKind::Approve));
    assert!(result.signals.contains(&Signal::Emit {
        key: "plan".to_string(),
        value: "step 1".to_string(),
    }));

    let prompt_file = result
        .output
        .lines()
        .find_map(|line| line.strip_prefix("file="))
        .expect("file line");
    assert!(prompt_file.contains("pilot-prompt-"));
    assert!(!Path::new(prompt_file).exists());
}

#[test]
fn script_args_come_before_prompt_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent.sh", "echo \"first=$1 count=$#\"\n");
    let executor = ScriptExecutor::new(&script, Vec::new());
    let mut req = request(temp.path(), "x");
    req.args = vec!["--fast".to_string()];

    let result = executor.run(&req, &CancelToken::new()).expect("run");

    assert!(result.output.starts_with("first=--fast count=2"));
}

#[test]
fn error_pattern_marks_successful_exit_as_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent.sh", "echo 'Error: Rate Limit reached'\n");
    let executor = ScriptExecutor::new(&script, vec!["rate limit".to_string()]);

    let result = executor
        .run(&request(temp.path(), "x"), &CancelToken::new())
        .expect("run");

    assert_eq!(result.exit_code, 0);
    assert_eq!(
        result.error.as_deref(),
        Some("detected error pattern: rate limit")
    );
}

#[test]
fn non_zero_exit_is_reported_with_merged_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent.sh", "echo 'to stderr' 1>&2\nexit 3\n");
    let executor = ScriptExecutor::new(&script, Vec::new());

    let result = executor
        .run(&request(temp.path(), "x"), &CancelToken::new())
        .expect("run");

    assert_eq!(result.exit_code, 3);
    assert_eq!(result.error.as_deref(), Some("exit code 3"));
    assert!(result.output.contains("to stderr"));
}

#[test]
fn missing_program_is_a_failed_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let executor = ScriptExecutor::new(temp.path().join("missing.sh"), Vec::new());

    let result = executor
        .run(&request(temp.path(), "x"), &CancelToken::new())
        .expect("run");

    assert_eq!(result.exit_code, -1);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|error| error.starts_with("failed to start"))
    );
}

#[test]
fn unwritable_prompt_dir_is_a_failed_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent.sh", "echo ran\n");
    let executor = ScriptExecutor::new(&script, Vec::new())
        .with_prompt_dir(temp.path().join("missing/dir"));

    let result = executor
        .run(&request(temp.path(), "x"), &CancelToken::new())
        .expect("setup failure is not an error");

    assert_eq!(result.exit_code, -1);
    assert!(result.output.is_empty());
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|error| error.starts_with("create prompt file"))
    );
}

#[test]
fn plain_executor_passes_model_and_prompt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tool = write_script(temp.path(), "tool", "echo \"$*\"\n");
    let executor = PlainExecutor::new(tool.display().to_string(), Vec::new());
    let mut req = request(temp.path(), "<pilot:completed/>");
    req.model = Some("small".to_string());

    let result = executor.run(&req, &CancelToken::new()).expect("run");

    assert_eq!(result.output, "--model small -p <pilot:completed/>\n");
    assert_eq!(
        result.signals,
        vec![Signal::Completed { summary: None }]
    );
}

#[test]
fn stream_json_extracts_assistant_text() {
    let temp = tempfile::tempdir().expect("tempdir");
    let program = write_script(
        temp.path(),
        "claude",
        r#"echo 'starting up'
echo '{"type":"system","subtype":"init"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"<pilot:reject>add tests</pilot:reject>"}]}}'
echo '{"type":"result","result":"<pilot:reject>add tests</pilot:reject>"}'
"#,
    );
    let executor = StreamJsonExecutor::with_program(program.display().to_string(), Vec::new());

    let result = executor
        .run(&request(temp.path(), "review"), &CancelToken::new())
        .expect("run");

    assert_eq!(result.exit_code, 0);
    assert!(result.output.starts_with("starting up\n"));
    assert_eq!(result.last_reject(), Some("add tests"));
    let rejects = result
        .signals
        .iter()
        .filter(|signal| signal.kind() == SignalKind::Reject)
        .count();
    assert_eq!(rejects, 1);
}

#[test]
fn streamed_update_is_written_inside_sandbox_only() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        temp.path(),
        "agent.sh",
        r#"echo '<pilot:update path=".pilot/notes.md">kept</pilot:update>'
echo '<pilot:update path="outside.md">dropped</pilot:update>'
"#,
    );
    let executor = ScriptExecutor::new(&script, Vec::new());
    let mut req = request(temp.path(), "x");
    req.sandbox = Some(Sandbox::new(temp.path(), ".pilot"));

    let result = executor.run(&req, &CancelToken::new()).expect("run");

    assert_eq!(
        fs::read_to_string(temp.path().join(".pilot/notes.md")).expect("notes"),
        "kept"
    );
    assert!(!temp.path().join("outside.md").exists());
    assert_eq!(
        result
            .signals
            .iter()
            .filter(|signal| signal.kind() == SignalKind::Update)
            .count(),
        2
    );
}

#[test]
fn cancellation_kills_the_process_group() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "agent.sh", "echo started\nsleep 30 &\nwait\n");
    let executor = ScriptExecutor::new(&script, Vec::new());
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        remote.cancel();
    });

    let started = Instant::now();
    let err = executor
        .run(&request(temp.path(), "x"), &cancel)
        .expect_err("cancelled");

    canceller.join().expect("canceller");
    assert!(is_cancelled(&err));
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[test]
fn shell_executor_captures_channels_separately() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = ShellExecutor
        .run(
            &request(temp.path(), "echo '<pilot:approve/>'; echo bad 1>&2; exit 4"),
            &CancelToken::new(),
        )
        .expect("run");

    assert_eq!(result.exit_code, 4);
    assert_eq!(result.output, "<pilot:approve/>\n");
    assert_eq!(result.error.as_deref(), Some("bad\n"));
    assert!(result.signals.is_empty());
}

fn fake_codex(dir: &Path, body: &str) -> (SplitStreamExecutor, String) {
    let program = write_script(dir, "codex", body)
        .to_string_lossy()
        .into_owned();
    (SplitStreamExecutor::with_program(&program, Vec::new()), program)
}

#[test]
fn split_stream_parses_stdout_only_and_reports_stderr_tail() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (executor, program) = fake_codex(
        temp.path(),
        r#"for last; do :; done
echo "sub=$1 prompt=$last"
echo '<pilot:approve/>'
echo '<pilot:reject>not from stderr</pilot:reject>' 1>&2
echo 'model overloaded' 1>&2
exit 3
"#,
    );

    let result = executor
        .run(&request(temp.path(), "review it"), &CancelToken::new())
        .expect("run");

    assert_eq!(result.exit_code, 3);
    assert!(result.output.starts_with("sub=exec prompt=review it\n"));
    assert!(result.has_signal(SignalKind::Approve));
    assert!(!result.has_signal(SignalKind::Reject));
    let error = result.error.expect("error");
    assert!(
        error.starts_with(&format!("{program} exited with code 3\nstderr: ")),
        "{error}"
    );
    assert!(error.contains("model overloaded"));
}

#[test]
fn split_stream_error_pattern_wins_over_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let program = write_script(
        temp.path(),
        "codex",
        "echo 'usage limit hit'\necho 'noise' 1>&2\nexit 1\n",
    );
    let executor = SplitStreamExecutor::with_program(
        program.to_string_lossy(),
        vec!["usage limit".to_string()],
    );

    let result = executor
        .run(&request(temp.path(), "x"), &CancelToken::new())
        .expect("run");

    assert_eq!(result.exit_code, 1);
    assert_eq!(
        result.error.as_deref(),
        Some("detected error pattern: usage limit")
    );
}

#[test]
fn split_stream_clean_exit_has_no_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (executor, _) = fake_codex(
        temp.path(),
        "echo done\necho '**Thinking**' 1>&2\n",
    );

    let result = executor
        .run(&request(temp.path(), "x"), &CancelToken::new())
        .expect("run");

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.error, None);
    assert_eq!(result.output, "done\n");
}

#[test]
fn split_stream_cancellation_terminates_tool() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (executor, _) = fake_codex(temp.path(), "echo started\nsleep 30\n");
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        remote.cancel();
    });

    let started = Instant::now();
    let err = executor
        .run(&request(temp.path(), "x"), &cancel)
        .expect_err("cancelled");

    canceller.join().expect("canceller");
    assert!(is_cancelled(&err));
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[test]
fn split_stream_cancellation_reaches_leftover_background_jobs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (executor, _) = fake_codex(temp.path(), "echo started\nsleep 30 &\nexit 0\n");
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        remote.cancel();
    });

    let started = Instant::now();
    let err = executor
        .run(&request(temp.path(), "x"), &cancel)
        .expect_err("cancelled");

    canceller.join().expect("canceller");
    assert!(is_cancelled(&err));
    assert!(started.elapsed() < Duration::from_secs(15));
}
