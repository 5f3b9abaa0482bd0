//! Routes tool names to executor instances, one cached instance per tool.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::debug;

use super::Executor;
use super::plain::PlainExecutor;
use super::script::ScriptExecutor;
use super::shell::ShellExecutor;
use super::split_stream::SplitStreamExecutor;
use super::stream_json::StreamJsonExecutor;

pub const CLAUDE_CODE: &str = "claude-code";
pub const CODEX: &str = "codex";
pub const CUSTOM: &str = "custom";
pub const SHELL: &str = "shell";

/// Lazily built executors keyed by tool name (`custom:<script>` for scripts).
///
/// `shell` is never cached; every request gets a fresh [`ShellExecutor`].
#[derive(Default)]
pub struct ExecutorPool {
    error_patterns: Vec<String>,
    cache: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorPool {
    pub fn new(error_patterns: Vec<String>) -> Self {
        Self {
            error_patterns,
            cache: HashMap::new(),
        }
    }

    /// Pre-seed the executor used for `key` (a tool name or `custom:<script>`).
    pub fn register(&mut self, key: impl Into<String>, executor: Arc<dyn Executor>) {
        self.cache.insert(key.into(), executor);
    }

    pub fn get(&mut self, tool: &str, script: Option<&str>) -> Result<Arc<dyn Executor>> {
        let key = cache_key(tool, script);
        if tool == SHELL && !self.cache.contains_key(&key) {
            return Ok(Arc::new(ShellExecutor));
        }
        if let Some(executor) = self.cache.get(&key) {
            return Ok(Arc::clone(executor));
        }
        let executor = self.create(tool, script)?;
        debug!(key = %key, "created executor");
        self.cache.insert(key, Arc::clone(&executor));
        Ok(executor)
    }

    fn create(&self, tool: &str, script: Option<&str>) -> Result<Arc<dyn Executor>> {
        let patterns = self.error_patterns.clone();
        let executor: Arc<dyn Executor> = match tool {
            CLAUDE_CODE => Arc::new(StreamJsonExecutor::new(patterns)),
            CODEX => Arc::new(SplitStreamExecutor::new(patterns)),
            CUSTOM => match script {
                Some(script) if !script.trim().is_empty() => {
                    Arc::new(ScriptExecutor::new(script, patterns))
                }
                _ => bail!("tool 'custom' requires a 'script' path"),
            },
            other => Arc::new(PlainExecutor::new(other, patterns)),
        };
        Ok(executor)
    }
}

/// Binary a tool launches, if any. `custom` runs its script and `shell` runs
/// `sh`, so neither names a program to look for.
pub fn tool_program(tool: &str) -> Option<&str> {
    match tool {
        CLAUDE_CODE => Some("claude"),
        CODEX => Some("codex"),
        CUSTOM | SHELL => None,
        other => Some(other),
    }
}

fn cache_key(tool: &str, script: Option<&str>) -> String {
    match script {
        Some(script) if tool == CUSTOM => format!("{CUSTOM}:{script}"),
        _ => tool.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_programs() {
        assert_eq!(tool_program(CLAUDE_CODE), Some("claude"));
        assert_eq!(tool_program(CODEX), Some("codex"));
        assert_eq!(tool_program("aider"), Some("aider"));
        assert_eq!(tool_program(CUSTOM), None);
        assert_eq!(tool_program(SHELL), None);
    }

    #[test]
    fn same_tool_returns_cached_instance() {
        let mut pool = ExecutorPool::new(Vec::new());
        let first = pool.get(CLAUDE_CODE, None).expect("claude");
        let second = pool.get(CLAUDE_CODE, None).expect("claude");
        assert!(Arc::ptr_eq(&first, &second));
        let other = pool.get("aider", None).expect("plain");
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn custom_scripts_are_cached_per_path() {
        let mut pool = ExecutorPool::new(Vec::new());
        let a = pool.get(CUSTOM, Some("./a.sh")).expect("a");
        let again = pool.get(CUSTOM, Some("./a.sh")).expect("a");
        let b = pool.get(CUSTOM, Some("./b.sh")).expect("b");
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn custom_without_script_is_an_error() {
        let mut pool = ExecutorPool::new(Vec::new());
        let err = pool.get(CUSTOM, None).err().expect("missing script");
        assert!(err.to_string().contains("script"));
    }

    #[test]
    fn shell_is_never_cached() {
        let mut pool = ExecutorPool::new(Vec::new());
        let first = pool.get(SHELL, None).expect("shell");
        let second = pool.get(SHELL, None).expect("shell");
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
