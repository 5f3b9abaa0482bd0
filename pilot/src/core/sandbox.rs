//! Path containment for agent-requested file writes.
//!
//! `update` and `draft` signals name files chosen by an external tool. Every
//! such path is resolved lexically (no filesystem access, so not-yet-existing
//! files work) and must land strictly inside the sandbox root.

use std::path::{Component, Path, PathBuf};

use crate::error::SecurityError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    /// Base for relative paths.
    base: PathBuf,
    /// Writes must stay below this directory.
    root: PathBuf,
}

impl Sandbox {
    pub fn new(base: impl AsRef<Path>, root: impl AsRef<Path>) -> Self {
        let base = normalize(base.as_ref());
        let root = normalize(&base.join(root.as_ref()));
        Self { base, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the target of an `update` signal.
    pub fn resolve_update(&self, path: &str) -> Result<PathBuf, SecurityError> {
        let resolved = normalize(&self.base.join(path));
        if self.contains(&resolved) {
            Ok(resolved)
        } else {
            Err(SecurityError::new("update path", path, &self.root))
        }
    }

    /// Resolve the file a `draft` signal is written to: `<root>/<label>.md`.
    pub fn resolve_draft(&self, label: &str) -> Result<PathBuf, SecurityError> {
        let resolved = normalize(&self.root.join(format!("{label}.md")));
        if self.contains(&resolved) {
            Ok(resolved)
        } else {
            Err(SecurityError::new("draft label", label, &self.root))
        }
    }

    fn contains(&self, path: &Path) -> bool {
        path != self.root && path.starts_with(&self.root)
    }
}

/// Lexically collapse `.` and `..` components.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new("/work/project", ".pilot")
    }

    #[test]
    fn update_inside_root_resolves() {
        let path = sandbox()
            .resolve_update(".pilot/session/plan.md")
            .expect("inside");
        assert_eq!(path, PathBuf::from("/work/project/.pilot/session/plan.md"));
    }

    #[test]
    fn update_with_dot_segments_is_normalized() {
        let path = sandbox()
            .resolve_update("./.pilot/a/../b.md")
            .expect("inside");
        assert_eq!(path, PathBuf::from("/work/project/.pilot/b.md"));
    }

    #[test]
    fn update_escaping_root_is_rejected() {
        let err = sandbox()
            .resolve_update(".pilot/../src/main.rs")
            .expect_err("escape");
        assert!(err.to_string().contains(".pilot/../src/main.rs"));
        assert!(sandbox().resolve_update("/etc/passwd").is_err());
        assert!(sandbox().resolve_update(".pilot").is_err());
    }

    #[test]
    fn draft_label_is_confined() {
        let path = sandbox().resolve_draft("design").expect("inside");
        assert_eq!(path, PathBuf::from("/work/project/.pilot/design.md"));
        assert!(sandbox().resolve_draft("../../outside").is_err());
    }

    #[test]
    fn normalize_keeps_leading_parent_on_relative_paths() {
        assert_eq!(normalize(Path::new("../a/./b/..")), PathBuf::from("../a"));
    }
}
