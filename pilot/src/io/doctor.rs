//! Environment checks behind `pilot doctor`.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::core::types::Step;
use crate::io::config::{DEFAULT_TOOL, PilotConfig, PilotPaths, load_config};
use crate::io::executor::pool::tool_program;
use crate::io::git::Git;

/// One line of the doctor report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub label: String,
    pub detail: String,
    pub ok: bool,
}

impl Check {
    fn new(label: impl Into<String>, detail: impl Into<String>, ok: bool) -> Self {
        Self {
            label: label.into(),
            detail: detail.into(),
            ok,
        }
    }

    pub fn render(&self) -> String {
        let mark = if self.ok { '✓' } else { '✗' };
        format!("  {:<16}{} {mark}", format!("{}:", self.label), self.detail)
    }
}

/// Check the config, agents, task directory, repository and agent tools.
/// `on_path` decides whether a program can be found.
pub fn run_checks(config_path: &Path, on_path: impl Fn(&str) -> bool) -> Vec<Check> {
    let mut checks = Vec::new();
    let shown = config_path.display();

    let config = if config_path.is_file() {
        match load_config(config_path) {
            Ok(config) => {
                checks.push(Check::new(
                    "config",
                    format!("{shown} ({} steps)", config.pipeline.len()),
                    true,
                ));
                Some(config)
            }
            Err(err) => {
                checks.push(Check::new("config", format!("{shown} — {err:#}"), false));
                None
            }
        }
    } else {
        checks.push(Check::new("config", format!("{shown} not found"), false));
        None
    };

    match &config {
        Some(config) => checks.push(Check::new(
            "agents",
            format!("{} loaded", config.agents.len()),
            true,
        )),
        None => checks.push(Check::new("agents", "no config", false)),
    }

    match PilotPaths::locate(config_path) {
        Ok(paths) => {
            let tasks = paths.session_dir.join("tasks");
            match count_markdown(&tasks) {
                Some(count) => checks.push(Check::new(
                    "tasks",
                    format!("{count} files in {}", tasks.display()),
                    true,
                )),
                None => checks.push(Check::new(
                    "tasks",
                    format!("{} not found", tasks.display()),
                    false,
                )),
            }
            match Git::new(&paths.project_dir).current_branch() {
                Some(branch) => checks.push(Check::new("git", format!("on branch {branch}"), true)),
                None => checks.push(Check::new("git", "not a repository or detached HEAD", false)),
            }
        }
        Err(err) => checks.push(Check::new("paths", format!("{err:#}"), false)),
    }

    for tool in tools_in_use(config.as_ref()) {
        let Some(program) = tool_program(&tool) else {
            continue;
        };
        let found = on_path(program);
        debug!(tool = %tool, program, found, "tool lookup");
        let detail = if found {
            format!("{program} found")
        } else {
            format!("{program} not found")
        };
        checks.push(Check::new(tool, detail, found));
    }
    checks
}

fn count_markdown(dir: &Path) -> Option<usize> {
    let entries = fs::read_dir(dir).ok()?;
    Some(
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "md"))
            .count(),
    )
}

/// Tools the pipeline can reach: the default, every agent step, every named
/// agent. Without a config only the built-in default is checked.
fn tools_in_use(config: Option<&PilotConfig>) -> BTreeSet<String> {
    let mut tools = BTreeSet::new();
    let Some(config) = config else {
        tools.insert(DEFAULT_TOOL.to_string());
        return tools;
    };
    tools.insert(config.defaults.tool.clone());
    tools.extend(config.agents.values().filter_map(|agent| agent.tool.clone()));
    collect_step_tools(config, &config.pipeline, &mut tools);
    tools
}

fn collect_step_tools(config: &PilotConfig, steps: &[Step], tools: &mut BTreeSet<String>) {
    for step in steps {
        match step {
            Step::Agent(agent) => {
                tools.insert(config.resolve_agent(agent).tool.to_string());
            }
            Step::Loop(inner) => collect_step_tools(config, &inner.steps, tools),
            Step::Shell(_) | Step::Gate(_) => {}
        }
    }
}
