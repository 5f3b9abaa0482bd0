//! Human checkpoints: gates, agent questions, and draft approval.

use std::io::Write;

use anyhow::{Context, Result};
use dialoguer::{Confirm, Input};

/// Outcome of a gate prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Continue,
    Quit,
}

impl GateDecision {
    /// `q` (any case, surrounding whitespace ignored) quits; anything else continues.
    pub fn from_response(response: &str) -> Self {
        if response.trim().eq_ignore_ascii_case("q") {
            GateDecision::Quit
        } else {
            GateDecision::Continue
        }
    }
}

/// Source of human answers. The engine blocks on these calls.
pub trait Prompter {
    fn gate(&self, step_id: &str) -> Result<GateDecision>;
    fn answer(&self, question: &str) -> Result<String>;
    /// Show a draft preview and ask whether to save it.
    fn approve_draft(&self, label: &str, preview: &str) -> Result<bool>;
}

/// Interactive terminal prompts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn gate(&self, step_id: &str) -> Result<GateDecision> {
        println!("\n⏸  Gate: {step_id}");
        let response: String = Input::new()
            .with_prompt("   Press Enter to continue, or 'q' to quit")
            .allow_empty(true)
            .interact_text()
            .context("read gate response")?;
        Ok(GateDecision::from_response(&response))
    }

    fn answer(&self, question: &str) -> Result<String> {
        println!("\n❓ {question}");
        let _ = std::io::stdout().flush();
        Input::new()
            .with_prompt(">")
            .allow_empty(true)
            .interact_text()
            .context("read answer")
    }

    fn approve_draft(&self, label: &str, preview: &str) -> Result<bool> {
        println!("\n📄 Draft: {label}\n");
        println!("{preview}");
        Confirm::new()
            .with_prompt("   Approve?")
            .default(false)
            .interact()
            .context("read draft approval")
    }
}
