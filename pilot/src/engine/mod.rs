//! Pipeline engine: walks the step tree, runs executors, and reacts to signals.
//!
//! The engine is single-threaded. It owns the runtime context, the session
//! store, and the progress log; executors are the only place threads exist.
//! Every fatal condition surfaces as an `Err` carrying a
//! [`PipelineError`](crate::error::PipelineError) or
//! [`SecurityError`](crate::error::SecurityError).

mod loops;
mod signals;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::cancel::CancelToken;
use crate::core::runtime::{LoopVars, RuntimeContext};
use crate::core::sandbox::Sandbox;
use crate::core::types::{AgentStep, ExecutorResult, GateStep, LoopKind, ShellStep, Step};
use crate::error::PipelineError;
use crate::io::config::PilotConfig;
use crate::io::executor::pool::SHELL;
use crate::io::executor::{ExecRequest, Executor, ExecutorPool};
use crate::io::git::{Git, Repository};
use crate::io::interact::{GateDecision, Prompter, TerminalPrompter};
use crate::io::progress::ProgressLog;
use crate::io::prompt::{expand, load_prompt};
use crate::io::session::Session;
use crate::io::stores::RunStores;

/// Width of signal payload previews in the progress log.
const SIGNAL_PREVIEW: usize = 80;

pub struct Engine {
    config: PilotConfig,
    runtime: RuntimeContext,
    cancel: CancelToken,
    session: Session,
    stores: RunStores,
    progress: ProgressLog,
    executors: ExecutorPool,
    repository: Box<dyn Repository>,
    prompter: Box<dyn Prompter>,
    sandbox: Sandbox,
}

impl Engine {
    /// Load session state and persisted emissions/Q&A, and open the progress log.
    pub fn new(config: PilotConfig, mut runtime: RuntimeContext, cancel: CancelToken) -> Result<Self> {
        let session = Session::load(&runtime.session_dir)?;
        let stores = RunStores::new(&runtime.session_dir);
        runtime.emissions.extend(stores.load_emissions()?);
        runtime.questions.extend(stores.load_questions()?);
        let progress = ProgressLog::open(&runtime.progress_path)?;
        let executors = ExecutorPool::new(config.error_patterns.clone());
        let sandbox = Sandbox::new(&runtime.project_dir, &runtime.config_dir);
        let repository: Box<dyn Repository> = Box::new(Git::new(&runtime.project_dir));
        debug!(
            emissions = runtime.emissions.len(),
            questions = runtime.questions.len(),
            "engine state loaded"
        );
        Ok(Self {
            config,
            runtime,
            cancel,
            session,
            stores,
            progress,
            executors,
            repository,
            prompter: Box::new(TerminalPrompter),
            sandbox,
        })
    }

    pub fn with_repository(mut self, repository: Box<dyn Repository>) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_prompter(mut self, prompter: Box<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Use `executor` for `key` (a tool name, `custom:<script>`, or `shell`).
    pub fn with_executor(mut self, key: &str, executor: Arc<dyn Executor>) -> Self {
        self.executors.register(key, executor);
        self
    }

    /// Write the progress log without echoing it to the terminal.
    pub fn quiet(mut self) -> Self {
        self.progress = self.progress.quiet();
        self
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run every top-level step not already marked complete.
    #[instrument(skip_all)]
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_pipeline();
        self.finish(&result);
        result
    }

    /// Run from `step_id` onwards, ignoring earlier steps entirely.
    #[instrument(skip_all, fields(step = step_id))]
    pub fn resume_from(&mut self, step_id: &str) -> Result<()> {
        let result = self.resume_pipeline(step_id);
        self.finish(&result);
        result
    }

    fn run_pipeline(&mut self) -> Result<()> {
        self.session.start()?;
        self.progress.log("Pipeline started");
        let steps = self.config.pipeline.clone();
        for step in &steps {
            self.cancel.check()?;
            if self.session.is_done(step.id()) {
                self.progress
                    .log(&format!("  skipping {} (already done)", step.id()));
                continue;
            }
            self.run_top_level(step)?;
        }
        self.progress.section("done");
        self.progress.log("Pipeline complete");
        Ok(())
    }

    fn resume_pipeline(&mut self, step_id: &str) -> Result<()> {
        self.progress
            .log(&format!("Resuming from step '{step_id}'"));
        let steps = self.config.pipeline.clone();
        let Some(start) = steps.iter().position(|step| step.id() == step_id) else {
            return Err(PipelineError::StepNotFound {
                step: step_id.to_string(),
            }
            .into());
        };
        for step in &steps[..start] {
            self.progress.log(&format!("  skipping {}", step.id()));
        }
        for step in &steps[start..] {
            self.cancel.check()?;
            self.run_top_level(step)?;
        }
        self.progress.section("done");
        self.progress.log("Pipeline complete");
        Ok(())
    }

    fn run_top_level(&mut self, step: &Step) -> Result<()> {
        self.progress.section(step.id());
        self.session.mark_current(step.id())?;
        self.run_step(step, &LoopVars::new())?;
        self.session.mark_done(step.id())?;
        info!(step = step.id(), "step done");
        Ok(())
    }

    fn finish(&mut self, result: &Result<()>) {
        if let Err(err) = result {
            self.progress.log(&format!("Pipeline stopped: {err:#}"));
        }
        self.progress.close();
    }

    /// Dispatch one step. Agent and shell steps return their result after
    /// universal signal handling; gates and loops return `None`.
    #[instrument(skip_all, fields(step = step.id(), kind = step.kind_label()))]
    pub(crate) fn run_step(&mut self, step: &Step, vars: &LoopVars) -> Result<Option<ExecutorResult>> {
        self.debug_snapshot(step, vars);
        let result = match step {
            Step::Gate(gate) => {
                self.run_gate(gate)?;
                return Ok(None);
            }
            Step::Loop(inner) => {
                match &inner.kind {
                    LoopKind::Iterator { over, var, order } => {
                        self.run_iterator(inner, over, var, *order, vars)?;
                    }
                    LoopKind::Convergence { until, max_rounds } => {
                        self.run_convergence(inner, *until, *max_rounds, vars)?;
                    }
                }
                return Ok(None);
            }
            Step::Agent(agent) => self.run_agent(agent, vars)?,
            Step::Shell(shell) => self.run_shell(shell, vars)?,
        };
        self.handle_signals(&result, step.id())?;
        Ok(Some(result))
    }

    fn run_agent(&mut self, step: &AgentStep, vars: &LoopVars) -> Result<ExecutorResult> {
        let retries = self.config.resolve_agent(step).retry;
        let mut result = self.execute_agent(step, vars)?;
        let mut attempt = 0;
        while !result.succeeded() && attempt < retries {
            attempt += 1;
            self.progress
                .log(&format!("  retry {attempt}/{retries} for '{}'", step.id));
            self.pause()?;
            result = self.execute_agent(step, vars)?;
        }
        Ok(result)
    }

    fn execute_agent(&mut self, step: &AgentStep, vars: &LoopVars) -> Result<ExecutorResult> {
        let raw = load_prompt(&step.prompt, &self.runtime.config_dir)
            .with_context(|| format!("load prompt for '{}'", step.id))?;
        let prompt = expand(&raw, &self.config, &self.runtime, vars);
        let resolved = self.config.resolve_agent(step);
        let executor = self.executors.get(resolved.tool, step.script.as_deref())?;
        self.progress
            .log(&format!("▸ {} ({}/{})", step.id, resolved.tool, resolved.model));

        let request = ExecRequest {
            workdir: self.runtime.project_dir.clone(),
            prompt,
            model: Some(resolved.model.to_string()),
            args: resolved.args.to_vec(),
            sandbox: Some(self.sandbox.clone()),
        };
        let result = executor.run(&request, &self.cancel)?;

        for signal in &result.signals {
            let summary = match signal.payload().filter(|payload| !payload.is_empty()) {
                Some(payload) => format!(" ({})", preview(payload, SIGNAL_PREVIEW)),
                None => String::new(),
            };
            self.progress
                .log(&format!("  signal: {}{summary}", signal.kind()));
        }
        match &result.error {
            Some(error) => self.progress.log(&format!(
                "  exit_code={} error={error}",
                result.exit_code
            )),
            None => self
                .progress
                .log(&format!("  exit_code={}", result.exit_code)),
        }
        Ok(result)
    }

    fn run_shell(&mut self, step: &ShellStep, vars: &LoopVars) -> Result<ExecutorResult> {
        let command = expand(&step.command, &self.config, &self.runtime, vars);
        self.progress.log(&format!("▸ {} (shell)", step.id));
        let executor = self.executors.get(SHELL, None)?;
        let request = ExecRequest {
            workdir: self.runtime.project_dir.clone(),
            prompt: command,
            ..ExecRequest::default()
        };
        let result = executor.run(&request, &self.cancel)?;
        if !result.succeeded() {
            let message = result
                .error
                .clone()
                .filter(|error| !error.trim().is_empty())
                .unwrap_or_else(|| format!("exit code {}", result.exit_code));
            return Err(PipelineError::ShellFailed {
                step: step.id.clone(),
                message,
            }
            .into());
        }
        self.progress
            .log(&format!("  exit_code={}", result.exit_code));
        Ok(result)
    }

    fn run_gate(&mut self, step: &GateStep) -> Result<()> {
        self.progress
            .log(&format!("▸ {} (gate) — waiting for user", step.id));
        match self.prompter.gate(&step.id)? {
            GateDecision::Quit => Err(PipelineError::GateAborted {
                step: step.id.clone(),
            }
            .into()),
            GateDecision::Continue => {
                self.progress.log("  approved by user");
                Ok(())
            }
        }
    }

    /// Sleep the configured delay; fails at once if cancelled meanwhile.
    fn pause(&self) -> Result<()> {
        let delay = Duration::from_millis(self.config.iteration_delay_ms);
        if self.cancel.sleep(delay) {
            return Err(PipelineError::Cancelled.into());
        }
        Ok(())
    }

    fn debug_snapshot(&mut self, step: &Step, vars: &LoopVars) {
        let Some(limit) = self.runtime.debug else {
            return;
        };
        let mut lines = vec![format!("  🔍 debug — {} ({})", step.id(), step.kind_label())];
        let state = self.session.state();
        if !state.completed.is_empty() {
            lines.push(format!("  │ history: [{}]", state.completed.join(", ")));
        }
        if let Some(current) = &state.current {
            lines.push(format!("  │ current: {current}"));
        }
        let rt = &self.runtime;
        let branch = state.branch.as_deref().unwrap_or(&rt.default_branch);
        lines.push(format!("  │ round={}  branch={branch}", rt.round));
        lines.push(format!("  │ diff_cmd={}", truncate_for_debug(&rt.diff_command, 60)));

        for (name, value) in template_vars(&self.config, rt, vars) {
            lines.push(format!("  │ {{{{{name}}}}} = {}", truncate_for_debug(&value, limit)));
        }

        match step {
            Step::Agent(agent) => {
                let resolved = self.config.resolve_agent(agent);
                lines.push(format!(
                    "  │ agent: tool={} model={} retry={} prompt={}",
                    resolved.tool,
                    resolved.model,
                    resolved.retry,
                    truncate_for_debug(&agent.prompt, 50)
                ));
            }
            Step::Shell(shell) => {
                lines.push(format!("  │ shell: {}", truncate_for_debug(&shell.command, 60)));
            }
            Step::Loop(inner) => match &inner.kind {
                LoopKind::Iterator { over, var, order } => lines.push(format!(
                    "  │ loop: over={over} as={var} order={}",
                    order.as_str()
                )),
                LoopKind::Convergence { until, max_rounds } => {
                    lines.push(format!("  │ loop: until={until} max_rounds={max_rounds}"));
                }
            },
            Step::Gate(_) => {}
        }

        for line in lines {
            self.progress.log(&line);
        }
    }
}

/// Every template variable a prompt would see, in expansion order. Later
/// sources replace earlier values in place.
fn template_vars(config: &PilotConfig, rt: &RuntimeContext, vars: &LoopVars) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    let mut set = |name: String, value: String| match out.iter_mut().find(|(key, _)| *key == name) {
        Some(entry) => entry.1 = value,
        None => out.push((name, value)),
    };
    for (name, value) in &config.inputs {
        set(name.clone(), value.clone());
    }
    set("default_branch".to_string(), rt.default_branch.clone());
    set("diff".to_string(), rt.diff_command.clone());
    set("round".to_string(), rt.round.to_string());
    for (key, value) in &rt.emissions {
        set(format!("emit.{key}"), value.clone());
    }
    for (name, value) in vars {
        set(name.clone(), value.clone());
    }
    if !rt.questions.is_empty() {
        set("questions".to_string(), format!("({} pairs)", rt.questions.len()));
    }
    out
}

/// Single-line rendering for debug output; `limit == 0` disables truncation.
fn truncate_for_debug(value: &str, limit: usize) -> String {
    let flat = value.replace('\n', "\\n");
    let len = flat.chars().count();
    if limit == 0 || len <= limit {
        return flat;
    }
    let head: String = flat.chars().take(limit).collect();
    format!("{head}…({len})")
}

/// First `max` characters of `text`.
fn preview(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
