//! ---
//! pvsim_section: "04-persistence"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Per-day record files and execution-time log."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::Result;

const PREFIX: &str = "Execution time of ";
const SUFFIX: &str = " seconds";

/// Append-only log with one line per finalized day:
/// `Execution time of <filename>: <seconds> seconds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    /// Log stored at `path`; the file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render one log line without the trailing newline.
    pub fn format_line(filename: &str, elapsed_seconds: i64) -> String {
        format!("{}{}: {}{}", PREFIX, filename, elapsed_seconds, SUFFIX)
    }

    /// Append the line for `filename`.
    pub fn record(&self, filename: &str, elapsed_seconds: i64) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", Self::format_line(filename, elapsed_seconds))?;
        file.flush()?;
        Ok(())
    }

    /// Parse every well-formed line back into `(filename, seconds)`.
    pub fn entries(&self) -> Result<Vec<(String, i64)>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(contents.lines().filter_map(parse_line).collect())
    }
}

fn parse_line(line: &str) -> Option<(String, i64)> {
    let body = line.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let (filename, seconds) = body.rsplit_once(": ")?;
    Some((filename.to_owned(), seconds.parse().ok()?))
}
