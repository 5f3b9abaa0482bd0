//! Control signals embedded in agent output.
//!
//! Agents steer the pipeline by writing `<pilot:*>` tags anywhere in their
//! free-text output. [`parse_signals`] extracts them with a fixed grammar and
//! never fails: malformed or unterminated tags simply produce no signal.
//!
//! The returned list is grouped by signal kind (in [`SignalKind::ALL`] order)
//! and in document order within a kind. Consumers only ask "did kind X occur"
//! or "what was the last X", never about interleaving across kinds.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// The closed set of signal kinds, in scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Approve,
    Reject,
    Blocked,
    Question,
    Update,
    Draft,
    Completed,
    Skip,
    Emit,
}

impl SignalKind {
    pub const ALL: [SignalKind; 9] = [
        SignalKind::Approve,
        SignalKind::Reject,
        SignalKind::Blocked,
        SignalKind::Question,
        SignalKind::Update,
        SignalKind::Draft,
        SignalKind::Completed,
        SignalKind::Skip,
        SignalKind::Emit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Approve => "approve",
            SignalKind::Reject => "reject",
            SignalKind::Blocked => "blocked",
            SignalKind::Question => "question",
            SignalKind::Update => "update",
            SignalKind::Draft => "draft",
            SignalKind::Completed => "completed",
            SignalKind::Skip => "skip",
            SignalKind::Emit => "emit",
        }
    }

    /// Case-insensitive lookup by tag name (`"APPROVE"` and `"approve"` both match).
    pub fn from_name(name: &str) -> Option<Self> {
        let lowered = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| kind.as_str() == lowered)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed control directive extracted from agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Approve,
    Reject { feedback: String },
    Blocked { reason: String },
    /// Question text; may itself be a JSON object with a `question` field.
    Question { text: String },
    /// File write request. `content` is kept verbatim (not trimmed).
    Update { path: String, content: String },
    /// Document proposal awaiting human approval. `content` is kept verbatim.
    Draft { label: String, content: String },
    Completed { summary: Option<String> },
    Skip { reason: Option<String> },
    Emit { key: String, value: String },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Approve => SignalKind::Approve,
            Signal::Reject { .. } => SignalKind::Reject,
            Signal::Blocked { .. } => SignalKind::Blocked,
            Signal::Question { .. } => SignalKind::Question,
            Signal::Update { .. } => SignalKind::Update,
            Signal::Draft { .. } => SignalKind::Draft,
            Signal::Completed { .. } => SignalKind::Completed,
            Signal::Skip { .. } => SignalKind::Skip,
            Signal::Emit { .. } => SignalKind::Emit,
        }
    }

    /// Main text payload, if the variant carries one.
    pub fn payload(&self) -> Option<&str> {
        match self {
            Signal::Approve => None,
            Signal::Reject { feedback } => Some(feedback),
            Signal::Blocked { reason } => Some(reason),
            Signal::Question { text } => Some(text),
            Signal::Update { content, .. } | Signal::Draft { content, .. } => Some(content),
            Signal::Completed { summary } => summary.as_deref(),
            Signal::Skip { reason } => reason.as_deref(),
            Signal::Emit { value, .. } => Some(value),
        }
    }
}

static APPROVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<pilot:approve\s*/>").expect("approve pattern"));
static REJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<pilot:reject>(.*?)</pilot:reject>").expect("reject pattern")
});
static BLOCKED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<pilot:blocked>(.*?)</pilot:blocked>").expect("blocked pattern")
});
static QUESTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<pilot:question>(.*?)</pilot:question>").expect("question pattern")
});
static UPDATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<pilot:update\s+path="([^"]+)">(.*?)</pilot:update>"#)
        .expect("update pattern")
});
static DRAFT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<pilot:draft\s+label="([^"]+)">(.*?)</pilot:draft>"#)
        .expect("draft pattern")
});
static COMPLETED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<pilot:completed\s*/>|<pilot:completed>(.*?)</pilot:completed>")
        .expect("completed pattern")
});
static SKIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<pilot:skip\s*/>|<pilot:skip>(.*?)</pilot:skip>").expect("skip pattern")
});
static EMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<pilot:emit\s+key="([^"]+)">(.*?)</pilot:emit>"#).expect("emit pattern")
});

/// Extract every `<pilot:*>` signal from `text`.
pub fn parse_signals(text: &str) -> Vec<Signal> {
    let mut signals = Vec::new();

    if APPROVE_RE.is_match(text) {
        signals.push(Signal::Approve);
    }
    for caps in REJECT_RE.captures_iter(text) {
        signals.push(Signal::Reject {
            feedback: caps[1].trim().to_string(),
        });
    }
    for caps in BLOCKED_RE.captures_iter(text) {
        signals.push(Signal::Blocked {
            reason: caps[1].trim().to_string(),
        });
    }
    for caps in QUESTION_RE.captures_iter(text) {
        signals.push(Signal::Question {
            text: caps[1].trim().to_string(),
        });
    }
    for caps in UPDATE_RE.captures_iter(text) {
        signals.push(Signal::Update {
            path: caps[1].to_string(),
            content: caps[2].to_string(),
        });
    }
    for caps in DRAFT_RE.captures_iter(text) {
        signals.push(Signal::Draft {
            label: caps[1].to_string(),
            content: caps[2].to_string(),
        });
    }
    for caps in COMPLETED_RE.captures_iter(text) {
        signals.push(Signal::Completed {
            summary: optional_body(caps.get(1).map(|m| m.as_str())),
        });
    }
    for caps in SKIP_RE.captures_iter(text) {
        signals.push(Signal::Skip {
            reason: optional_body(caps.get(1).map(|m| m.as_str())),
        });
    }
    for caps in EMIT_RE.captures_iter(text) {
        signals.push(Signal::Emit {
            key: caps[1].to_string(),
            value: caps[2].trim().to_string(),
        });
    }

    signals
}

/// True if any signal in `signals` is of `kind`.
pub fn has_kind(signals: &[Signal], kind: SignalKind) -> bool {
    signals.iter().any(|signal| signal.kind() == kind)
}

fn optional_body(body: Option<&str>) -> Option<String> {
    body.map(str::trim)
        .filter(|body| !body.is_empty())
        .map(str::to_string)
}
