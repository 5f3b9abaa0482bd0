//! Git adapter for branch setup and convergence detection.
//!
//! Pilot only reads repository state (HEAD, branch names) and creates the
//! work branch; commits are made by the agents themselves. The engine sees
//! git through the [`Repository`] trait so tests can script HEAD movement.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument, warn};

/// Names tried, in order, when `origin/HEAD` does not name a local branch.
const COMMON_DEFAULTS: [&str; 4] = ["main", "master", "trunk", "develop"];
const MAX_SLUG_LEN: usize = 50;

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("slug pattern"));

/// Repository state the engine needs during a run.
pub trait Repository {
    /// Marker for the current commit (`git rev-parse HEAD`); `None` when unknown.
    fn head_marker(&self) -> Option<String>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Current branch name; `None` on detached HEAD or outside a repository.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Option<String> {
        let name = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"]).ok()?;
        let name = name.trim();
        if name == "HEAD" || name.is_empty() {
            debug!("detached HEAD or no repository");
            return None;
        }
        debug!(branch = %name, "current branch");
        Some(name.to_string())
    }

    /// Detect the default branch: `origin/HEAD` if it exists locally, then a
    /// common name present both locally and on origin, then any common name
    /// present locally, else `master`.
    #[instrument(skip_all)]
    pub fn default_branch(&self) -> String {
        if let Ok(remote_head) = self.run_capture(&["symbolic-ref", "refs/remotes/origin/HEAD"])
            && let Some(name) = remote_head.trim().rsplit('/').next()
            && !name.is_empty()
            && self.ref_exists(&format!("refs/heads/{name}"))
        {
            return name.to_string();
        }
        let with_remote = COMMON_DEFAULTS.iter().find(|name| {
            self.ref_exists(&format!("refs/heads/{name}"))
                && self.ref_exists(&format!("refs/remotes/origin/{name}"))
        });
        let local_only = || {
            COMMON_DEFAULTS
                .iter()
                .find(|name| self.ref_exists(&format!("refs/heads/{name}")))
        };
        with_remote
            .or_else(local_only)
            .map_or_else(|| "master".to_string(), |name| name.to_string())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    fn ref_exists(&self, reference: &str) -> bool {
        self.run(&["rev-parse", "--verify", "--quiet", reference])
            .is_ok_and(|output| output.status.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl Repository for Git {
    fn head_marker(&self) -> Option<String> {
        match self.run_capture(&["rev-parse", "HEAD"]) {
            Ok(sha) => Some(sha.trim().to_string()).filter(|sha| !sha.is_empty()),
            Err(err) => {
                debug!(err = %err, "no head marker");
                None
            }
        }
    }
}

/// Command reviewers run to see every change on the work branch.
pub fn diff_command(default_branch: &str) -> String {
    format!("git diff {default_branch}...HEAD")
}

/// Work branch name from the first meaningful line of `input_path`:
/// `pilot/<slug>`, or `pilot/run-<unix_secs>` when nothing usable is found.
pub fn derive_branch_name(input_path: &Path, unix_secs: i64) -> String {
    let fallback = format!("pilot/run-{unix_secs}");
    let contents = match fs::read_to_string(input_path) {
        Ok(contents) => contents,
        Err(err) => {
            debug!(path = %input_path.display(), err = %err, "no input file for branch name");
            return fallback;
        }
    };
    for line in contents.lines() {
        let line = line.trim().trim_start_matches('#').trim();
        if line.is_empty() || line.starts_with("<!--") {
            continue;
        }
        let slug = slugify(line);
        if !slug.is_empty() {
            return format!("pilot/{slug}");
        }
    }
    warn!(path = %input_path.display(), "input file has no usable line for a branch name");
    fallback
}

fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let dashed = SLUG_RE.replace_all(&lowered, "-");
    let trimmed = dashed.trim_matches('-');
    trimmed.chars().take(MAX_SLUG_LEN).collect()
}
