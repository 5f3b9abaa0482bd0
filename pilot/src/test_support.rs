//! Test doubles and builders for engine tests.
//!
//! The scripted doubles share their state behind `Arc<Mutex<_>>`, so a test
//! keeps a clone to inspect calls after handing the other to the engine.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::cancel::CancelToken;
use crate::core::runtime::RuntimeContext;
use crate::core::signals::{SignalKind, parse_signals};
use crate::core::types::{
    AgentStep, ExecutorResult, GateStep, LoopKind, LoopStep, ShellStep, SortOrder, Step,
};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::git::{Repository, diff_command};
use crate::io::interact::{GateDecision, Prompter};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result as an executor would build it from `output`.
pub fn output_result(output: &str, exit_code: i32) -> ExecutorResult {
    ExecutorResult {
        output: output.to_string(),
        exit_code,
        error: (exit_code != 0).then(|| format!("exit code {exit_code}")),
        signals: parse_signals(output),
    }
}

/// Executor returning queued results in order; a drained queue yields a
/// successful empty result.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    inner: Arc<Mutex<ExecutorScript>>,
}

#[derive(Default)]
struct ExecutorScript {
    results: VecDeque<ExecutorResult>,
    requests: Vec<ExecRequest>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue results built from raw outputs, all with exit code 0.
    pub fn with_outputs(outputs: &[&str]) -> Self {
        let executor = Self::new();
        for output in outputs {
            executor.push(output_result(output, 0));
        }
        executor
    }

    pub fn push(&self, result: ExecutorResult) {
        lock(&self.inner).results.push_back(result);
    }

    pub fn calls(&self) -> usize {
        lock(&self.inner).requests.len()
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.inner)
            .requests
            .iter()
            .map(|request| request.prompt.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        lock(&self.inner).requests.clone()
    }

    pub fn shared(&self) -> Arc<dyn Executor> {
        Arc::new(self.clone())
    }
}

impl Executor for ScriptedExecutor {
    fn run(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecutorResult> {
        cancel.check()?;
        let mut script = lock(&self.inner);
        script.requests.push(request.clone());
        Ok(script.results.pop_front().unwrap_or_default())
    }
}

/// Repository whose head marker follows a script. Each call consumes one
/// entry; the last entry repeats once the script is drained.
#[derive(Clone, Default)]
pub struct ScriptedRepository {
    inner: Arc<Mutex<RepositoryScript>>,
}

#[derive(Default)]
struct RepositoryScript {
    markers: VecDeque<Option<String>>,
    last: Option<String>,
    calls: usize,
}

impl ScriptedRepository {
    /// HEAD never moves.
    pub fn fixed(marker: &str) -> Self {
        Self::sequence(&[Some(marker)])
    }

    /// No repository: every lookup returns `None`.
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn sequence(markers: &[Option<&str>]) -> Self {
        let script = RepositoryScript {
            markers: markers
                .iter()
                .map(|marker| marker.map(str::to_string))
                .collect(),
            ..RepositoryScript::default()
        };
        Self {
            inner: Arc::new(Mutex::new(script)),
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.inner).calls
    }

    pub fn boxed(&self) -> Box<dyn Repository> {
        Box::new(self.clone())
    }
}

impl Repository for ScriptedRepository {
    fn head_marker(&self) -> Option<String> {
        let mut script = lock(&self.inner);
        script.calls += 1;
        if let Some(next) = script.markers.pop_front() {
            script.last = next;
        }
        script.last.clone()
    }
}

/// Prompter answering from queues. Gates continue, answers are empty, and
/// drafts are declined once the queues run out.
#[derive(Clone, Default)]
pub struct ScriptedPrompter {
    inner: Arc<Mutex<PrompterScript>>,
}

#[derive(Default)]
struct PrompterScript {
    gates: VecDeque<GateDecision>,
    answers: VecDeque<String>,
    drafts: VecDeque<bool>,
    gate_calls: Vec<String>,
    questions: Vec<String>,
    previews: Vec<(String, String)>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate_decision(self, decision: GateDecision) -> Self {
        lock(&self.inner).gates.push_back(decision);
        self
    }

    pub fn answer_with(self, answer: &str) -> Self {
        lock(&self.inner).answers.push_back(answer.to_string());
        self
    }

    pub fn approve_drafts(self, approve: bool) -> Self {
        lock(&self.inner).drafts.push_back(approve);
        self
    }

    /// Step ids of every gate shown.
    pub fn gates_shown(&self) -> Vec<String> {
        lock(&self.inner).gate_calls.clone()
    }

    pub fn questions(&self) -> Vec<String> {
        lock(&self.inner).questions.clone()
    }

    /// `(label, preview)` of every draft shown.
    pub fn previews(&self) -> Vec<(String, String)> {
        lock(&self.inner).previews.clone()
    }

    pub fn boxed(&self) -> Box<dyn Prompter> {
        Box::new(self.clone())
    }
}

impl Prompter for ScriptedPrompter {
    fn gate(&self, step_id: &str) -> Result<GateDecision> {
        let mut script = lock(&self.inner);
        script.gate_calls.push(step_id.to_string());
        Ok(script.gates.pop_front().unwrap_or(GateDecision::Continue))
    }

    fn answer(&self, question: &str) -> Result<String> {
        let mut script = lock(&self.inner);
        script.questions.push(question.to_string());
        Ok(script.answers.pop_front().unwrap_or_default())
    }

    fn approve_draft(&self, label: &str, preview: &str) -> Result<bool> {
        let mut script = lock(&self.inner);
        script
            .previews
            .push((label.to_string(), preview.to_string()));
        Ok(script.drafts.pop_front().unwrap_or(false))
    }
}

/// Runtime rooted at `project`: config dir `.pilot/`, session dir
/// `.pilot/session/`, default branch `main`.
pub fn runtime_in(project: &Path) -> RuntimeContext {
    let config_dir = project.join(".pilot");
    let session_dir = config_dir.join("session");
    RuntimeContext {
        project_dir: project.to_path_buf(),
        progress_path: session_dir.join("progress-test.log"),
        config_dir,
        session_dir,
        default_branch: "main".to_string(),
        diff_command: diff_command("main"),
        ..RuntimeContext::default()
    }
}

pub fn agent(id: &str, prompt: &str) -> Step {
    Step::Agent(AgentStep {
        id: id.to_string(),
        prompt: prompt.to_string(),
        ..AgentStep::default()
    })
}

/// Agent step with an explicit retry count.
pub fn agent_with_retry(id: &str, prompt: &str, retry: u32) -> Step {
    Step::Agent(AgentStep {
        id: id.to_string(),
        prompt: prompt.to_string(),
        retry: Some(retry),
        ..AgentStep::default()
    })
}

pub fn shell(id: &str, command: &str) -> Step {
    Step::Shell(ShellStep {
        id: id.to_string(),
        command: command.to_string(),
    })
}

pub fn gate(id: &str) -> Step {
    Step::Gate(GateStep { id: id.to_string() })
}

pub fn iterator(id: &str, over: &str, var: &str, order: SortOrder, steps: Vec<Step>) -> Step {
    Step::Loop(LoopStep {
        id: id.to_string(),
        kind: LoopKind::Iterator {
            over: over.to_string(),
            var: var.to_string(),
            order,
        },
        steps,
    })
}

/// Convergence loop ending on `approve`.
pub fn convergence(id: &str, max_rounds: u32, steps: Vec<Step>) -> Step {
    Step::Loop(LoopStep {
        id: id.to_string(),
        kind: LoopKind::Convergence {
            until: SignalKind::Approve,
            max_rounds,
        },
        steps,
    })
}
