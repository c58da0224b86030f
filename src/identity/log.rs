//! Persistence of encrypted identity log lines.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Name of the log file inside the data directory.
pub const LOG_FILE_NAME: &str = "cache";

/// Raw line storage for the identity log. Every method blocks.
pub trait IdentityLogStore: Send + Sync {
    /// All stored lines in order, blank lines skipped.
    fn read_lines(&self) -> Result<Vec<String>>;

    fn append_lines(&self, lines: &[String]) -> Result<()>;

    /// Replace the whole log with `lines`.
    fn overwrite_lines(&self, lines: &[String]) -> Result<()>;
}

/// Newline-separated log file.
#[derive(Debug, Clone)]
pub struct FileIdentityLog {
    path: PathBuf,
}

impl FileIdentityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The log file inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(LOG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        Ok(())
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut text = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    text
}

impl IdentityLogStore for FileIdentityLog {
    fn read_lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    fn append_lines(&self, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(join_lines(lines).as_bytes())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        Ok(())
    }

    fn overwrite_lines(&self, lines: &[String]) -> Result<()> {
        self.ensure_parent()?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, join_lines(lines)).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileIdentityLog::in_dir(&dir.path().join("nested"));
        assert!(log.read_lines().unwrap().is_empty());
    }

    #[test]
    fn append_then_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileIdentityLog::in_dir(dir.path());

        log.append_lines(&["a".into(), "b".into()]).unwrap();
        log.append_lines(&["c".into()]).unwrap();
        assert_eq!(log.read_lines().unwrap(), vec!["a", "b", "c"]);

        log.overwrite_lines(&["z".into()]).unwrap();
        assert_eq!(log.read_lines().unwrap(), vec!["z"]);
        assert!(!log.path().with_extension("tmp").exists());

        log.overwrite_lines(&[]).unwrap();
        assert!(log.read_lines().unwrap().is_empty());
    }
}
