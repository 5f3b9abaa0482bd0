//! Per-run artifact stores under the session directory.
//!
//! - `emissions/<key>.md`: latest value of each emitted key
//! - `qa/<step>-<NNN>.json`: answered questions, numbered per step
//! - `reviews/<loop>-round-<NN>.md`: reviewer feedback per convergence round

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::QaPair;
use crate::error::SecurityError;
use crate::io::session::write_atomic;

const EMISSIONS_DIR: &str = "emissions";
const QA_DIR: &str = "qa";
const REVIEWS_DIR: &str = "reviews";

/// Paths of the stores for one session directory.
#[derive(Debug, Clone)]
pub struct RunStores {
    session_dir: PathBuf,
}

impl RunStores {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
        }
    }

    pub fn emissions_dir(&self) -> PathBuf {
        self.session_dir.join(EMISSIONS_DIR)
    }

    pub fn qa_dir(&self) -> PathBuf {
        self.session_dir.join(QA_DIR)
    }

    pub fn reviews_dir(&self) -> PathBuf {
        self.session_dir.join(REVIEWS_DIR)
    }

    /// Every persisted emission, keyed by file stem.
    pub fn load_emissions(&self) -> Result<BTreeMap<String, String>> {
        let mut emissions = BTreeMap::new();
        for path in files_with_extension(&self.emissions_dir(), "md")? {
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let value = fs::read_to_string(&path)
                .with_context(|| format!("read emission {}", path.display()))?;
            emissions.insert(key.to_string(), value);
        }
        debug!(count = emissions.len(), "emissions loaded");
        Ok(emissions)
    }

    /// Write `emissions/<key>.md`. The key must name a single file directly
    /// inside the emissions dir, anything else is a [`SecurityError`].
    pub fn save_emission(&self, key: &str, value: &str) -> Result<PathBuf> {
        let dir = self.emissions_dir();
        if !is_plain_key(key) {
            return Err(SecurityError::new("emission key", key, &dir).into());
        }
        let path = dir.join(format!("{key}.md"));
        write_atomic(&path, value)?;
        Ok(path)
    }

    /// Persisted Q&A pairs in file-name order.
    pub fn load_questions(&self) -> Result<Vec<QaPair>> {
        let mut pairs = Vec::new();
        for path in files_with_extension(&self.qa_dir(), "json")? {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read qa {}", path.display()))?;
            let pair: QaPair = serde_json::from_str(&contents)
                .with_context(|| format!("parse qa {}", path.display()))?;
            pairs.push(pair);
        }
        debug!(count = pairs.len(), "questions loaded");
        Ok(pairs)
    }

    /// Write `qa/<step>-<NNN>.json` where NNN is one past the step's existing files.
    pub fn save_question(&self, pair: &QaPair) -> Result<PathBuf> {
        let dir = self.qa_dir();
        let prefix = format!("{}-", pair.step_id);
        let existing = files_with_extension(&dir, "json")?
            .iter()
            .filter(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.strip_prefix(&prefix))
                    .is_some_and(|seq| !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit()))
            })
            .count();
        let path = dir.join(format!("{}-{:03}.json", pair.step_id, existing + 1));
        let mut buf = serde_json::to_string_pretty(pair).context("serialize qa")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        Ok(path)
    }

    pub fn save_review(&self, loop_id: &str, round: u32, feedback: &str) -> Result<PathBuf> {
        let path = self
            .reviews_dir()
            .join(format!("{loop_id}-round-{round:02}.md"));
        write_atomic(&path, feedback)?;
        Ok(path)
    }
}

/// Emitted keys become file stems: no separators, no `..`, nothing empty.
fn is_plain_key(key: &str) -> bool {
    !key.trim().is_empty()
        && key != "."
        && !key.contains("..")
        && !key.contains(['/', '\\', '\0'])
}

/// Sorted files in `dir` with the given extension; a missing dir is empty.
fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read dir entry in {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
