//! Signal effects that apply to every agent and shell result.
//!
//! `approve`, `reject`, and `skip` only mean something inside loops and are
//! handled there.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Engine, SIGNAL_PREVIEW, preview};
use crate::core::signals::Signal;
use crate::core::types::{ExecutorResult, QaPair};
use crate::error::PipelineError;

/// Characters of a draft shown before asking for approval.
const DRAFT_PREVIEW: usize = 500;

impl Engine {
    /// Apply universal signals in the order they were parsed.
    pub(super) fn handle_signals(&mut self, result: &ExecutorResult, step_id: &str) -> Result<()> {
        for signal in &result.signals {
            match signal {
                Signal::Blocked { reason } => {
                    return Err(PipelineError::Blocked {
                        step: step_id.to_string(),
                        reason: reason.clone(),
                    }
                    .into());
                }
                Signal::Question { text } => self.ask_question(step_id, text)?,
                Signal::Update { path, content } => self.apply_update(path, content)?,
                Signal::Draft { label, content } => self.review_draft(label, content)?,
                Signal::Completed { summary } => {
                    let suffix = summary
                        .as_deref()
                        .filter(|summary| !summary.is_empty())
                        .map(|summary| format!(" ({summary})"))
                        .unwrap_or_default();
                    self.progress
                        .log(&format!("  ✓ task completed{suffix}"));
                }
                Signal::Emit { key, value } => {
                    self.stores.save_emission(key, value)?;
                    self.runtime.emissions.insert(key.clone(), value.clone());
                    self.progress.log(&format!(
                        "  emit: {key}={}",
                        preview(value, SIGNAL_PREVIEW)
                    ));
                }
                Signal::Approve | Signal::Reject { .. } | Signal::Skip { .. } => {}
            }
        }
        Ok(())
    }

    fn ask_question(&mut self, step_id: &str, payload: &str) -> Result<()> {
        let question = question_text(payload);
        let answer = self.prompter.answer(&question)?;
        self.progress.log(&format!("  Q: {question}"));
        self.progress.log(&format!("  A: {answer}"));
        let pair = QaPair {
            step_id: step_id.to_string(),
            question,
            answer,
        };
        self.stores.save_question(&pair)?;
        self.runtime.questions.push(pair);
        Ok(())
    }

    fn apply_update(&mut self, path: &str, content: &str) -> Result<()> {
        let target = self.sandbox.resolve_update(path)?;
        write_file(&target, content)?;
        let shown = self.relative_to_project(&target);
        self.progress.log(&format!("  wrote {shown}"));
        Ok(())
    }

    fn review_draft(&mut self, label: &str, content: &str) -> Result<()> {
        let excerpt = if content.chars().count() > DRAFT_PREVIEW {
            format!("{}...", preview(content, DRAFT_PREVIEW))
        } else {
            content.to_string()
        };
        if !self.prompter.approve_draft(label, &excerpt)? {
            debug!(label, "draft declined");
            return Ok(());
        }
        let target = self.sandbox.resolve_draft(label)?;
        write_file(&target, content)?;
        let shown = self.relative_to_project(&target);
        self.progress
            .log(&format!("  draft '{label}' approved, wrote {shown}"));
        Ok(())
    }

    fn relative_to_project(&self, path: &Path) -> String {
        path.strip_prefix(&self.runtime.project_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// The `question` field of a JSON object payload, else the payload itself.
fn question_text(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => match map.get("question") {
            Some(Value::String(question)) => question.clone(),
            Some(other) => other.to_string(),
            None => payload.to_string(),
        },
        Ok(_) => payload.to_string(),
        Err(err) => {
            if payload.trim_start().starts_with('{') {
                warn!(err = %err, "question payload looks like JSON but does not parse");
            }
            payload.to_string()
        }
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("write {}", path.display()))
}
