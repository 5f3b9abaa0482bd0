//! Project-local agent library: one markdown file per agent under
//! `<config_dir>/agents/`.
//!
//! A file may open with a YAML frontmatter block setting the same fields as
//! `[agents.<name>]`; the rest of the file is the prompt. The agent is named
//! after the file stem.
//!
//! ```text
//! ---
//! tool: codex
//! model: o3
//! retry: 1
//! ---
//! Review the diff and reply with <pilot:approve/> or <pilot:reject>.
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::io::config::{AgentDef, AgentSource};

pub const AGENTS_DIR: &str = "agents";
const FENCE: &str = "---";

/// Options accepted in an agent file's frontmatter.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentFrontmatter {
    pub tool: Option<String>,
    pub model: Option<String>,
    pub script: Option<String>,
    pub retry: Option<u32>,
    pub args: Option<Vec<String>>,
}

/// Split `content` into frontmatter options and the trimmed body.
///
/// Content without a complete `---` block, or whose block is not valid YAML
/// for [`AgentFrontmatter`], is returned whole as the body.
pub fn parse_frontmatter(content: &str) -> (AgentFrontmatter, String) {
    let Some(rest) = content.strip_prefix("---\n") else {
        return (AgentFrontmatter::default(), content.to_string());
    };
    let Some(end) = rest.find(&format!("\n{FENCE}")) else {
        return (AgentFrontmatter::default(), content.to_string());
    };
    let header = &rest[..end];
    let body = &rest[end + 1 + FENCE.len()..];
    let body = body.strip_prefix('\n').unwrap_or(body);

    if header.trim().is_empty() {
        return (AgentFrontmatter::default(), body.trim().to_string());
    }
    match serde_yaml::from_str::<AgentFrontmatter>(header) {
        Ok(options) => (options, body.trim().to_string()),
        Err(err) => {
            warn!(err = %err, "ignoring invalid agent frontmatter");
            (AgentFrontmatter::default(), content.to_string())
        }
    }
}

/// Load one agent file.
pub fn load_agent_file(path: &Path) -> Result<AgentDef> {
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .with_context(|| format!("agent file has no name {}", path.display()))?;
    let content =
        fs::read_to_string(path).with_context(|| format!("read agent file {}", path.display()))?;
    let (options, prompt) = parse_frontmatter(&content);
    Ok(AgentDef {
        name,
        prompt,
        tool: options.tool,
        model: options.model,
        script: options.script,
        retry: options.retry,
        args: options.args,
        source: AgentSource::File(path.to_path_buf()),
    })
}

/// Every `*.md` agent in `dir`, keyed by name. A missing directory is an
/// empty library.
pub fn load_agent_library(dir: &Path) -> Result<BTreeMap<String, AgentDef>> {
    let mut agents = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(agents);
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("read agents dir {}", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("read agents dir {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "md") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let agent = load_agent_file(&path)?;
        debug!(name = %agent.name, path = %path.display(), "loaded agent file");
        agents.insert(agent.name.clone(), agent);
    }
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_sets_options_and_body_is_trimmed() {
        let (options, body) = parse_frontmatter(
            "---\ntool: codex\nmodel: o3\nretry: 2\nargs: [\"--fast\"]\n---\n\nReview the diff.\n\n",
        );
        assert_eq!(options.tool.as_deref(), Some("codex"));
        assert_eq!(options.model.as_deref(), Some("o3"));
        assert_eq!(options.retry, Some(2));
        assert_eq!(options.args, Some(vec!["--fast".to_string()]));
        assert_eq!(options.script, None);
        assert_eq!(body, "Review the diff.");
    }

    #[test]
    fn content_without_frontmatter_is_all_prompt() {
        let content = "Just check for bugs.\n";
        let (options, body) = parse_frontmatter(content);
        assert_eq!(options, AgentFrontmatter::default());
        assert_eq!(body, content);
    }

    #[test]
    fn unclosed_or_invalid_frontmatter_keeps_content() {
        let unclosed = "---\ntool: codex\nno closing fence";
        assert_eq!(parse_frontmatter(unclosed).1, unclosed);

        let invalid = "---\nretry: many\n---\nbody";
        let (options, body) = parse_frontmatter(invalid);
        assert_eq!(options, AgentFrontmatter::default());
        assert_eq!(body, invalid);
    }

    #[test]
    fn empty_frontmatter_block_is_allowed() {
        let (options, body) = parse_frontmatter("---\n\n---\nbody\n");
        assert_eq!(options, AgentFrontmatter::default());
        assert_eq!(body, "body");
    }

    #[test]
    fn library_loads_sorted_markdown_files_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join(AGENTS_DIR);
        fs::create_dir_all(dir.join("nested.md")).expect("mkdir");
        fs::write(dir.join("reviewer.md"), "---\ntool: codex\n---\nReview.").expect("write");
        fs::write(dir.join("planner.md"), "Plan the work.").expect("write");
        fs::write(dir.join("notes.txt"), "ignored").expect("write");

        let agents = load_agent_library(&dir).expect("load");

        assert_eq!(
            agents.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["planner", "reviewer"]
        );
        let reviewer = &agents["reviewer"];
        assert_eq!(reviewer.prompt, "Review.");
        assert_eq!(reviewer.tool.as_deref(), Some("codex"));
        assert_eq!(reviewer.source, AgentSource::File(dir.join("reviewer.md")));
        assert_eq!(agents["planner"].tool, None);
    }

    #[test]
    fn missing_library_dir_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agents = load_agent_library(&temp.path().join("absent")).expect("load");
        assert!(agents.is_empty());
    }
}
