//! Prompt loading and `{{...}}` template expansion.
//!
//! Expansion is plain text substitution applied in a fixed order:
//! inputs, runtime values, `{{file:...}}`, loop variables, `{{emit.key}}`,
//! `{{questions[:step]}}`, `{{agent:name}}`. Placeholders nobody defines are
//! left untouched so a typo stays visible in the prompt.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::{Captures, Regex};

use crate::core::runtime::{LoopVars, RuntimeContext};
use crate::core::types::QaPair;
use crate::io::config::{AgentDef, PilotConfig};

static FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{file:(.+?)\}\}").expect("file pattern"));
static EMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{emit\.([^}]+)\}\}").expect("emit pattern"));
static QUESTIONS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{questions(?::([a-zA-Z0-9_-]+))?\}\}").expect("questions pattern")
});
static AGENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{agent:([a-zA-Z0-9_-]+)\}\}").expect("agent pattern"));

/// True if `value` names a prompt file rather than holding inline text:
/// a single line ending in `.md` or `.txt`.
pub fn is_prompt_file(value: &str) -> bool {
    let trimmed = value.trim();
    !value.contains('\n') && (trimmed.ends_with(".md") || trimmed.ends_with(".txt"))
}

/// Prompt text for a step: the referenced file (relative to `config_dir`) or
/// the inline value itself.
pub fn load_prompt(value: &str, config_dir: &Path) -> Result<String> {
    if !is_prompt_file(value) {
        return Ok(value.to_string());
    }
    let path = config_dir.join(value.trim());
    fs::read_to_string(&path).with_context(|| format!("read prompt {}", path.display()))
}

/// Apply every template expansion to `text`.
pub fn expand(
    text: &str,
    config: &PilotConfig,
    runtime: &RuntimeContext,
    loop_vars: &LoopVars,
) -> String {
    let mut text = replace_all(text, &config.inputs);
    text = expand_runtime(&text, runtime);
    text = expand_files(&text, &runtime.config_dir);
    text = replace_all(&text, loop_vars);
    text = expand_emissions(&text, &runtime.emissions);
    text = expand_questions(&text, &runtime.questions);
    expand_agents(&text, &config.agents, &runtime.config_dir)
}

fn replace_all(text: &str, vars: &BTreeMap<String, String>) -> String {
    vars.iter().fold(text.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{{{name}}}}}"), value)
    })
}

fn expand_runtime(text: &str, runtime: &RuntimeContext) -> String {
    text.replace("{{default_branch}}", &runtime.default_branch)
        .replace("{{diff}}", &runtime.diff_command)
        .replace(
            "{{progress_file_path}}",
            &runtime.progress_path.display().to_string(),
        )
        .replace("{{round}}", &runtime.round.to_string())
}

fn expand_files(text: &str, config_dir: &Path) -> String {
    FILE_RE
        .replace_all(text, |caps: &Captures| {
            let rel = &caps[1];
            fs::read_to_string(config_dir.join(rel))
                .unwrap_or_else(|_| format!("[FILE NOT FOUND: {rel}]"))
        })
        .into_owned()
}

fn expand_emissions(text: &str, emissions: &BTreeMap<String, String>) -> String {
    EMIT_RE
        .replace_all(text, |caps: &Captures| match emissions.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn expand_questions(text: &str, questions: &[QaPair]) -> String {
    QUESTIONS_RE
        .replace_all(text, |caps: &Captures| {
            let filtered: Vec<&QaPair> = match caps.get(1) {
                Some(step) => questions
                    .iter()
                    .filter(|qa| qa.step_id == step.as_str())
                    .collect(),
                None => questions.iter().collect(),
            };
            format_qa(&filtered)
        })
        .into_owned()
}

/// Markdown block of Q&A pairs grouped by step (first-seen order).
pub fn format_qa(pairs: &[&QaPair]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let mut groups: Vec<(&str, Vec<&QaPair>)> = Vec::new();
    for &qa in pairs {
        match groups.iter_mut().find(|(step, _)| *step == qa.step_id) {
            Some((_, items)) => items.push(qa),
            None => groups.push((qa.step_id.as_str(), vec![qa])),
        }
    }
    let sections: Vec<String> = groups
        .into_iter()
        .map(|(step, items)| {
            let mut lines = vec![format!("### {step}")];
            for qa in items {
                lines.push(format!("**Q:** {}", qa.question));
                lines.push(format!("**A:** {}", qa.answer));
                lines.push(String::new());
            }
            lines.join("\n")
        })
        .collect();
    format!("## Prior Q&A\n\n{}", sections.join("\n"))
}

fn expand_agents(text: &str, agents: &BTreeMap<String, AgentDef>, config_dir: &Path) -> String {
    AGENT_RE
        .replace_all(text, |caps: &Captures| {
            let Some(agent) = agents.get(&caps[1]) else {
                return caps[0].to_string();
            };
            let prompt = if is_prompt_file(&agent.prompt) {
                fs::read_to_string(config_dir.join(agent.prompt.trim()))
                    .unwrap_or_else(|_| agent.prompt.clone())
            } else {
                agent.prompt.clone()
            };
            subagent_instructions(agent, &prompt)
        })
        .into_owned()
}

/// Instructions asking the running agent to delegate `prompt` to a subagent.
fn subagent_instructions(agent: &AgentDef, prompt: &str) -> String {
    let model_clause = agent
        .model
        .as_deref()
        .map(|model| format!(" with model={model}"))
        .unwrap_or_default();
    format!(
        "Use the Task tool{model_clause} to launch a subagent with this prompt:\n\"{prompt}\"\n\nReport findings only, no positive observations."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn runtime(config_dir: PathBuf) -> RuntimeContext {
        RuntimeContext {
            config_dir,
            default_branch: "main".to_string(),
            diff_command: "git diff main...HEAD".to_string(),
            progress_path: PathBuf::from("/tmp/progress.log"),
            round: 2,
            ..RuntimeContext::default()
        }
    }

    fn qa(step: &str, question: &str, answer: &str) -> QaPair {
        QaPair {
            step_id: step.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
        }
    }

    #[test]
    fn prompt_file_detection() {
        assert!(is_prompt_file("prompts/plan.md"));
        assert!(is_prompt_file(" notes.txt "));
        assert!(!is_prompt_file("Write a plan.md file\nthen stop"));
        assert!(!is_prompt_file("Summarize the diff"));
    }

    #[test]
    fn load_prompt_reads_relative_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("prompts")).expect("mkdir");
        fs::write(temp.path().join("prompts/plan.md"), "Plan {{TASK}}").expect("write");
        assert_eq!(
            load_prompt("prompts/plan.md", temp.path()).expect("load"),
            "Plan {{TASK}}"
        );
        assert_eq!(load_prompt("inline", temp.path()).expect("inline"), "inline");
        assert!(load_prompt("missing.md", temp.path()).is_err());
    }

    #[test]
    fn expands_runtime_inputs_and_loop_vars() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = PilotConfig::default();
        config
            .inputs
            .insert("input_file".to_string(), "input.md".to_string());
        let mut vars = LoopVars::new();
        vars.insert("FEEDBACK".to_string(), "add tests".to_string());

        let text = "{{input_file}} on {{default_branch}} r{{round}}: {{diff}} -> {{FEEDBACK}} {{progress_file_path}} {{unknown}}";
        assert_eq!(
            expand(text, &config, &runtime(temp.path().to_path_buf()), &vars),
            "input.md on main r2: git diff main...HEAD -> add tests /tmp/progress.log {{unknown}}"
        );
    }

    #[test]
    fn file_placeholder_reads_or_marks_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("ctx.md"), "context").expect("write");
        let out = expand(
            "[{{file:ctx.md}}] [{{file:nope.md}}]",
            &PilotConfig::default(),
            &runtime(temp.path().to_path_buf()),
            &LoopVars::new(),
        );
        assert_eq!(out, "[context] [[FILE NOT FOUND: nope.md]]");
    }

    #[test]
    fn unknown_emissions_stay_intact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut rt = runtime(temp.path().to_path_buf());
        rt.emissions.insert("plan".to_string(), "step 1".to_string());
        let out = expand(
            "{{emit.plan}} / {{emit.other}}",
            &PilotConfig::default(),
            &rt,
            &LoopVars::new(),
        );
        assert_eq!(out, "step 1 / {{emit.other}}");
    }

    #[test]
    fn questions_are_grouped_and_filterable() {
        let pairs = [
            qa("plan", "Which db?", "postgres"),
            qa("review", "Strict?", "yes"),
            qa("plan", "Auth?", "oauth"),
        ];
        let temp = tempfile::tempdir().expect("tempdir");
        let mut rt = runtime(temp.path().to_path_buf());
        rt.questions = pairs.to_vec();

        let all = expand("{{questions}}", &PilotConfig::default(), &rt, &LoopVars::new());
        assert_eq!(
            all,
            "## Prior Q&A\n\n### plan\n**Q:** Which db?\n**A:** postgres\n\n**Q:** Auth?\n**A:** oauth\n\n### review\n**Q:** Strict?\n**A:** yes\n"
        );

        let filtered = expand(
            "{{questions:review}}",
            &PilotConfig::default(),
            &rt,
            &LoopVars::new(),
        );
        assert_eq!(filtered, "## Prior Q&A\n\n### review\n**Q:** Strict?\n**A:** yes\n");

        rt.questions.clear();
        assert_eq!(
            expand("[{{questions}}]", &PilotConfig::default(), &rt, &LoopVars::new()),
            "[]"
        );
    }

    #[test]
    fn agent_placeholder_wraps_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = PilotConfig::default();
        config.agents.insert(
            "security".to_string(),
            AgentDef {
                name: "security".to_string(),
                prompt: "Audit auth".to_string(),
                model: Some("opus".to_string()),
                ..AgentDef::default()
            },
        );
        let out = expand(
            "{{agent:security}} {{agent:ghost}}",
            &config,
            &runtime(temp.path().to_path_buf()),
            &LoopVars::new(),
        );
        assert!(out.starts_with("Use the Task tool with model=opus to launch a subagent"));
        assert!(out.contains("\"Audit auth\""));
        assert!(out.ends_with("{{agent:ghost}}"));
    }
}
