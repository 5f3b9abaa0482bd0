//! Run progress log: `[HH:MM:SS] message` lines appended to a file in the
//! session directory and echoed to the terminal.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::warn;

#[derive(Debug)]
pub struct ProgressLog {
    path: PathBuf,
    file: Option<File>,
    echo: bool,
}

impl ProgressLog {
    /// Open (append) the log at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create progress dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open progress log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            echo: true,
        })
    }

    /// Stop echoing to the terminal; the file is still written.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, message: &str) {
        let line = format!("[{}] {message}", Local::now().format("%H:%M:%S"));
        self.write_line(&format!("{line}\n"));
        if self.echo {
            println!("{line}");
        }
    }

    /// Divider between pipeline phases: `--- label ---`.
    pub fn section(&mut self, label: &str) {
        let divider = format!("--- {label} ---");
        self.write_line(&format!("\n{divider}\n"));
        if self.echo {
            println!("\n{divider}");
        }
    }

    /// Flush and release the file. Later messages are echoed only.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take()
            && let Err(err) = file.flush()
        {
            warn!(path = %self.path.display(), err = %err, "flush progress log failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn write_line(&mut self, text: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(err) = file.write_all(text.as_bytes()).and_then(|()| file.flush()) {
            warn!(path = %self.path.display(), err = %err, "write progress log failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_timestamped_and_sections_plain() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session/progress-1.log");
        let mut log = ProgressLog::open(&path).expect("open").quiet();
        log.log("Pipeline started");
        log.section("plan");
        log.close();
        log.log("after close");
        assert!(log.is_closed());

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('['));
        assert_eq!(&lines[0][9..], "] Pipeline started");
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "--- plan ---");
    }
}
