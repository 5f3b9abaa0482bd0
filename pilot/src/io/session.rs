//! Durable run progress (`<session>/session.json`).
//!
//! Only top-level step completion is tracked. Iterator progress lives in the
//! task directory itself (processed files move to `completed/`), and
//! convergence loops restart from round 1 after an interruption.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SESSION_FILE: &str = "session.json";

/// Persisted fields, in file order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    pub branch: Option<String>,
    /// RFC 3339 UTC timestamp of the latest `start`.
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed: Vec<String>,
    pub current: Option<String>,
}

/// Session state bound to its file. Every mutation is saved before returning.
#[derive(Debug)]
pub struct Session {
    path: PathBuf,
    state: SessionState,
}

impl Session {
    /// Load `<session_dir>/session.json`; a missing file yields the default state.
    pub fn load(session_dir: &Path) -> Result<Self> {
        let path = session_dir.join(SESSION_FILE);
        let state = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read session {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse session {}", path.display()))?
        } else {
            SessionState::default()
        };
        debug!(path = %path.display(), completed = state.completed.len(), "session loaded");
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_done(&self, step_id: &str) -> bool {
        self.state.completed.iter().any(|id| id == step_id)
    }

    pub fn mark_current(&mut self, step_id: &str) -> Result<()> {
        self.state.current = Some(step_id.to_string());
        self.save()
    }

    /// Append to `completed` (once) and clear `current` if it names this step.
    pub fn mark_done(&mut self, step_id: &str) -> Result<()> {
        if !self.is_done(step_id) {
            self.state.completed.push(step_id.to_string());
        }
        if self.state.current.as_deref() == Some(step_id) {
            self.state.current = None;
        }
        self.save()
    }

    pub fn set_branch(&mut self, branch: &str) -> Result<()> {
        self.state.branch = Some(branch.to_string());
        self.save()
    }

    /// Stamp the run start time.
    pub fn start(&mut self) -> Result<()> {
        self.state.started_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        self.save()
    }

    fn save(&self) -> Result<()> {
        debug!(path = %self.path.display(), current = ?self.state.current, "writing session");
        let mut buf = serde_json::to_string_pretty(&self.state).context("serialize session")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = Session::load(temp.path()).expect("load");
        assert_eq!(session.state(), &SessionState::default());
        assert!(!session.path().exists());
    }

    #[test]
    fn mutations_persist_immediately() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut session = Session::load(temp.path()).expect("load");
        session.set_branch("pilot/add-login").expect("branch");
        session.mark_current("plan").expect("current");

        let reloaded = Session::load(temp.path()).expect("reload");
        assert_eq!(reloaded.state().current.as_deref(), Some("plan"));
        assert_eq!(reloaded.state().branch.as_deref(), Some("pilot/add-login"));

        session.mark_done("plan").expect("done");
        session.mark_done("plan").expect("done twice");
        let reloaded = Session::load(temp.path()).expect("reload");
        assert_eq!(reloaded.state().completed, vec!["plan".to_string()]);
        assert_eq!(reloaded.state().current, None);
    }

    #[test]
    fn mark_done_keeps_unrelated_current() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut session = Session::load(temp.path()).expect("load");
        session.mark_current("b").expect("current");
        session.mark_done("a").expect("done");
        assert_eq!(session.state().current.as_deref(), Some("b"));
    }

    #[test]
    fn session_file_format_is_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut session = Session::load(temp.path()).expect("load");
        session.mark_done("a").expect("done");
        let contents = fs::read_to_string(session.path()).expect("read");
        let expected = "{\n  \"branch\": null,\n  \"started_at\": null,\n  \"completed\": [\n    \"a\"\n  ],\n  \"current\": null\n}\n";
        assert_eq!(contents, expected);
        assert!(!temp.path().join("session.json.tmp").exists());
    }

    #[test]
    fn start_stamps_utc_time() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut session = Session::load(temp.path()).expect("load");
        session.start().expect("start");
        let started = session.state().started_at.clone().expect("stamped");
        assert!(started.ends_with('Z'));
    }
}
