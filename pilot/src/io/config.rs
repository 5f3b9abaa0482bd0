//! Pipeline definition stored in `.pilot/pipeline.toml`.
//!
//! The file is parsed into loosely-typed `Raw*` structs first, then converted
//! into the closed [`Step`] tree and validated. Every rule that can be checked
//! without running anything is checked here so a run never starts with a
//! pipeline that would fail on shape alone.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::debug;

use crate::core::signals::SignalKind;
use crate::core::types::{
    AgentStep, GateStep, LoopKind, LoopStep, ShellStep, SortOrder, Step, collect_ids,
};
use crate::io::agents::{AGENTS_DIR, load_agent_library};
use crate::io::executor::pool::CUSTOM;

pub const DEFAULT_CONFIG_PATH: &str = ".pilot/pipeline.toml";
pub const DEFAULT_TOOL: &str = "claude-code";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4";
pub const DEFAULT_ITERATION_DELAY_MS: u64 = 2000;
pub const DEFAULT_MAX_ROUNDS: u32 = 5;
const SUPPORTED_VERSIONS: [&str; 2] = ["1", "1.0"];

/// A loaded, validated pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PilotConfig {
    pub version: String,
    /// `{{name}}` substitutions available to every prompt.
    pub inputs: BTreeMap<String, String>,
    pub defaults: AgentDefaults,
    /// Phrases that mark agent output as failed regardless of exit code.
    pub error_patterns: Vec<String>,
    /// Pause between retries, iterator items, and convergence rounds.
    pub iteration_delay_ms: u64,
    /// Reusable agent definitions (`@name` references, `{{agent:name}}`).
    pub agents: BTreeMap<String, AgentDef>,
    pub pipeline: Vec<Step>,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            inputs: BTreeMap::new(),
            defaults: AgentDefaults::default(),
            error_patterns: Vec::new(),
            iteration_delay_ms: DEFAULT_ITERATION_DELAY_MS,
            agents: BTreeMap::new(),
            pipeline: Vec::new(),
        }
    }
}

/// Fallbacks for agent steps that do not set their own values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDefaults {
    pub tool: String,
    pub model: String,
    pub retry: u32,
    pub args: Vec<String>,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            tool: DEFAULT_TOOL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            retry: 0,
            args: Vec::new(),
        }
    }
}

/// A named agent from `[agents.<name>]` or the agent library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentDef {
    pub name: String,
    pub prompt: String,
    pub tool: Option<String>,
    pub model: Option<String>,
    pub script: Option<String>,
    pub retry: Option<u32>,
    pub args: Option<Vec<String>>,
    pub source: AgentSource,
}

/// Where an agent definition came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AgentSource {
    /// `[agents.<name>]` in the pipeline file.
    #[default]
    Config,
    /// A markdown file in the agent library.
    File(PathBuf),
}

impl AgentSource {
    /// Short label for listings: `pipeline.toml` or `agents/<file>`.
    pub fn label(&self) -> String {
        match self {
            AgentSource::Config => "pipeline.toml".to_string(),
            AgentSource::File(path) => match path.file_name() {
                Some(name) => format!("{AGENTS_DIR}/{}", name.to_string_lossy()),
                None => path.display().to_string(),
            },
        }
    }
}

/// Directories derived from the config file location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PilotPaths {
    pub config_path: PathBuf,
    /// Directory holding the config; prompt files and task dirs resolve here.
    pub config_dir: PathBuf,
    /// Project root: the parent of `.pilot/`, else the config dir itself.
    pub project_dir: PathBuf,
    /// `<config_dir>/session`
    pub session_dir: PathBuf,
}

impl PilotPaths {
    pub fn locate(config_path: &Path) -> Result<Self> {
        let absolute = if config_path.is_absolute() {
            config_path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("resolve current directory")?
                .join(config_path)
        };
        let config_dir = absolute
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("config path missing parent {}", absolute.display()))?;
        let project_dir = match (config_dir.file_name(), config_dir.parent()) {
            (Some(name), Some(parent)) if name == ".pilot" => parent.to_path_buf(),
            _ => config_dir.clone(),
        };
        Ok(Self {
            session_dir: config_dir.join("session"),
            config_path: absolute,
            config_dir,
            project_dir,
        })
    }
}

impl PilotConfig {
    /// Execution parameters an agent step resolves to: (tool, model, retry, args).
    pub fn resolve_agent<'a>(&'a self, step: &'a AgentStep) -> ResolvedAgent<'a> {
        ResolvedAgent {
            tool: step.tool.as_deref().unwrap_or(&self.defaults.tool),
            model: step.model.as_deref().unwrap_or(&self.defaults.model),
            retry: step.retry.unwrap_or(self.defaults.retry),
            args: step.args.as_deref().unwrap_or(&self.defaults.args),
        }
    }

    /// One line per known agent with its effective tool and model.
    pub fn describe_agents(&self) -> Vec<String> {
        if self.agents.is_empty() {
            return vec!["No agents configured.".to_string()];
        }
        let mut lines = vec![format!("Agents ({} loaded):", self.agents.len())];
        for (name, agent) in &self.agents {
            let tool = agent.tool.as_deref().unwrap_or(&self.defaults.tool);
            let model = agent.model.as_deref().unwrap_or(&self.defaults.model);
            lines.push(format!(
                "  {name:<16}tool={tool:<14}model={model:<16}source={}",
                agent.source.label()
            ));
        }
        lines
    }

    /// Human-readable tree of the pipeline, one line per entry.
    pub fn describe_steps(&self, config_dir: Option<&Path>) -> Vec<String> {
        let mut lines = Vec::new();
        self.describe_into(&self.pipeline, 0, config_dir, &mut lines);
        lines
    }

    fn describe_into(
        &self,
        steps: &[Step],
        depth: usize,
        config_dir: Option<&Path>,
        lines: &mut Vec<String>,
    ) {
        let indent = "  ".repeat(depth);
        for step in steps {
            match step {
                Step::Agent(agent) => {
                    let resolved = self.resolve_agent(agent);
                    lines.push(format!(
                        "{indent}▸ {} [agent {}/{}]",
                        agent.id, resolved.tool, resolved.model
                    ));
                    if let Some(script) = &agent.script {
                        lines.push(format!("{indent}    script: {script}"));
                    }
                    if resolved.retry > 0 {
                        lines.push(format!("{indent}    retry: {}", resolved.retry));
                    }
                    if let Some(dir) = config_dir
                        && crate::io::prompt::is_prompt_file(&agent.prompt)
                    {
                        let status = if dir.join(agent.prompt.trim()).is_file() {
                            "ok"
                        } else {
                            "MISSING"
                        };
                        lines.push(format!("{indent}    prompt: {} ({status})", agent.prompt));
                    }
                }
                Step::Shell(shell) => {
                    lines.push(format!("{indent}▸ {} [shell] {}", shell.id, shell.command));
                }
                Step::Gate(gate) => lines.push(format!("{indent}⏸ {} [gate]", gate.id)),
                Step::Loop(inner) => {
                    let header = match &inner.kind {
                        LoopKind::Iterator { over, var, order } => format!(
                            "{indent}↻ {} [loop over={over} as={var} order={}]",
                            inner.id,
                            order.as_str()
                        ),
                        LoopKind::Convergence { until, max_rounds } => format!(
                            "{indent}↻ {} [loop until={until} max={max_rounds}]",
                            inner.id
                        ),
                    };
                    lines.push(header);
                    self.describe_into(&inner.steps, depth + 1, config_dir, lines);
                }
            }
        }
    }
}

/// Agent step parameters after applying defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAgent<'a> {
    pub tool: &'a str,
    pub model: &'a str,
    pub retry: u32,
    pub args: &'a [String],
}

/// Load and validate a pipeline definition, together with the agent library
/// in the `agents/` directory next to it.
pub fn load_config(path: &Path) -> Result<PilotConfig> {
    debug!(path = %path.display(), "loading pipeline config");
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let library = match path.parent() {
        Some(dir) => load_agent_library(&dir.join(AGENTS_DIR))?,
        None => BTreeMap::new(),
    };
    parse_config_with_agents(&contents, library)
        .with_context(|| format!("invalid config {}", path.display()))
}

/// Parse and validate pipeline TOML.
pub fn parse_config(contents: &str) -> Result<PilotConfig> {
    parse_config_with_agents(contents, BTreeMap::new())
}

/// Parse pipeline TOML on top of a library of file agents. `[agents.<name>]`
/// entries replace library agents of the same name.
pub fn parse_config_with_agents(
    contents: &str,
    library: BTreeMap<String, AgentDef>,
) -> Result<PilotConfig> {
    if contents.trim().is_empty() {
        bail!("config is empty");
    }
    let raw: RawConfig = toml::from_str(contents).context("parse pipeline toml")?;
    let version = parse_version(raw.version.as_ref())?;

    let mut agents = library;
    for (name, def) in raw.agents {
        let agent = AgentDef {
            name: name.clone(),
            prompt: def.prompt,
            tool: def.tool,
            model: def.model,
            script: def.script,
            retry: def.retry,
            args: def.args,
            source: AgentSource::Config,
        };
        agents.insert(name, agent);
    }

    let pipeline = raw
        .pipeline
        .into_iter()
        .map(|step| convert_step(step, &agents))
        .collect::<Result<Vec<_>>>()?;
    validate_pipeline(&pipeline)?;

    let defaults = AgentDefaults {
        tool: raw.defaults.tool.unwrap_or_else(|| DEFAULT_TOOL.to_string()),
        model: raw.defaults.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        retry: raw.defaults.retry.unwrap_or(0),
        args: raw.defaults.args.unwrap_or_default(),
    };
    Ok(PilotConfig {
        version,
        inputs: raw.inputs,
        defaults,
        error_patterns: raw.defaults.error_patterns,
        iteration_delay_ms: raw
            .defaults
            .iteration_delay_ms
            .unwrap_or(DEFAULT_ITERATION_DELAY_MS),
        agents,
        pipeline,
    })
}

fn parse_version(value: Option<&toml::Value>) -> Result<String> {
    let version = match value {
        None => bail!("missing 'version' field"),
        Some(toml::Value::String(text)) => text.clone(),
        Some(toml::Value::Integer(number)) => number.to_string(),
        Some(toml::Value::Float(number)) if *number == 1.0 => "1.0".to_string(),
        Some(other) => other.to_string(),
    };
    if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
        bail!("unsupported config version: {version}");
    }
    Ok(version)
}

fn convert_step(raw: RawStep, agents: &BTreeMap<String, AgentDef>) -> Result<Step> {
    let id = raw
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| anyhow!("step missing 'id' field"))?;

    let kinds = [
        raw.agent.is_some(),
        raw.shell.is_some(),
        raw.gate.unwrap_or(false),
        raw.loop_.is_some(),
    ];
    match kinds.iter().filter(|set| **set).count() {
        0 => bail!("step '{id}' needs one of 'agent', 'shell', 'gate', or 'loop'"),
        1 => {}
        _ => bail!("step '{id}' sets more than one of 'agent', 'shell', 'gate', 'loop'"),
    }
    if raw.loop_.is_none() && !raw.steps.is_empty() {
        bail!("step '{id}' has child 'steps' but is not a loop");
    }

    if let Some(agent) = raw.agent {
        return convert_agent(id, agent, agents).map(Step::Agent);
    }
    if let Some(shell) = raw.shell {
        let command = match shell {
            RawShell::Command(command) | RawShell::Table { command } => command,
        };
        if command.trim().is_empty() {
            bail!("shell step '{id}' has an empty command");
        }
        return Ok(Step::Shell(ShellStep { id, command }));
    }
    if let Some(loop_def) = raw.loop_ {
        let kind = convert_loop_kind(&id, loop_def)?;
        let steps = raw
            .steps
            .into_iter()
            .map(|child| convert_step(child, agents))
            .collect::<Result<Vec<_>>>()?;
        if steps.is_empty() {
            bail!("loop '{id}' has no child steps");
        }
        return Ok(Step::Loop(LoopStep { id, kind, steps }));
    }
    Ok(Step::Gate(GateStep { id }))
}

fn convert_agent(
    id: String,
    raw: RawAgent,
    agents: &BTreeMap<String, AgentDef>,
) -> Result<AgentStep> {
    let mut step = match raw {
        RawAgent::Prompt(prompt) => AgentStep {
            id,
            prompt,
            ..AgentStep::default()
        },
        RawAgent::Table(table) => AgentStep {
            id,
            prompt: table.prompt.unwrap_or_default(),
            tool: table.tool,
            model: table.model,
            script: table.script,
            retry: table.retry,
            args: table.args,
        },
    };

    // `@name`: the named agent provides the base, step fields override it.
    if let Some(name) = step.prompt.trim().strip_prefix('@') {
        let agent = agents
            .get(name)
            .ok_or_else(|| anyhow!("step '{}' references unknown agent '@{name}'", step.id))?;
        step.prompt = agent.prompt.clone();
        step.tool = step.tool.or_else(|| agent.tool.clone());
        step.model = step.model.or_else(|| agent.model.clone());
        step.script = step.script.or_else(|| agent.script.clone());
        step.retry = step.retry.or(agent.retry);
        step.args = step.args.or_else(|| agent.args.clone());
    }

    if step.prompt.trim().is_empty() {
        bail!("agent step '{}' has an empty prompt", step.id);
    }
    if step.tool.as_deref() == Some(CUSTOM) && step.script.is_none() {
        bail!("step '{}' uses tool='custom' but no 'script' provided", step.id);
    }
    Ok(step)
}

fn convert_loop_kind(id: &str, raw: RawLoop) -> Result<LoopKind> {
    match (raw.over, raw.until) {
        (Some(_), Some(_)) => bail!("loop '{id}' sets both 'over' and 'until'"),
        (None, None) => bail!("loop '{id}' must have 'over' or 'until'"),
        (Some(over), None) => {
            let var = raw
                .as_var
                .filter(|var| !var.trim().is_empty())
                .ok_or_else(|| anyhow!("iterator loop '{id}' requires 'as' variable"))?;
            let order = match raw.order.as_deref() {
                None | Some("asc") => SortOrder::Asc,
                Some("desc") => SortOrder::Desc,
                Some(other) => bail!("loop '{id}': order must be 'asc' or 'desc', got '{other}'"),
            };
            Ok(LoopKind::Iterator { over, var, order })
        }
        (None, Some(until)) => {
            let until = SignalKind::from_name(&until)
                .ok_or_else(|| anyhow!("loop '{id}': unknown signal '{until}' in 'until'"))?;
            let max_rounds = raw.max_rounds.unwrap_or(DEFAULT_MAX_ROUNDS);
            if max_rounds == 0 {
                bail!("loop '{id}': max_rounds must be >= 1");
            }
            Ok(LoopKind::Convergence { until, max_rounds })
        }
    }
}

fn validate_pipeline(steps: &[Step]) -> Result<()> {
    if steps.is_empty() {
        bail!("pipeline has no steps");
    }
    let mut seen = HashSet::new();
    for id in collect_ids(steps) {
        if !seen.insert(id) {
            bail!("duplicate step id: '{id}'");
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    version: Option<toml::Value>,
    #[serde(default)]
    inputs: BTreeMap<String, String>,
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    agents: BTreeMap<String, RawAgentDef>,
    #[serde(default)]
    pipeline: Vec<RawStep>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawDefaults {
    tool: Option<String>,
    model: Option<String>,
    retry: Option<u32>,
    args: Option<Vec<String>>,
    error_patterns: Vec<String>,
    iteration_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAgentDef {
    prompt: String,
    tool: Option<String>,
    model: Option<String>,
    script: Option<String>,
    retry: Option<u32>,
    args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    id: Option<String>,
    agent: Option<RawAgent>,
    shell: Option<RawShell>,
    gate: Option<bool>,
    #[serde(rename = "loop")]
    loop_: Option<RawLoop>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

/// `agent = "prompts/x.md"` / `agent = "@name"` or a full table.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAgent {
    Prompt(String),
    Table(RawAgentTable),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAgentTable {
    prompt: Option<String>,
    tool: Option<String>,
    model: Option<String>,
    script: Option<String>,
    retry: Option<u32>,
    args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawShell {
    Command(String),
    Table { command: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLoop {
    over: Option<String>,
    #[serde(rename = "as")]
    as_var: Option<String>,
    order: Option<String>,
    until: Option<String>,
    max_rounds: Option<u32>,
}
