//! ---
//! pvsim_section: "04-persistence"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Per-day record files and execution-time log."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Output side of the PV service: one delimited file per simulated day,
//! written under a temporary name and renamed into place when the day closes,
//! plus an append-only log of per-day execution times.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing output files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for CSV encoding issues.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// The record delimiter is not a single byte.
    #[error("delimiter {0:?} must be a single ASCII character")]
    InvalidDelimiter(String),
}

pub mod execution_log;
pub mod record;
pub mod summary;

pub use execution_log::ExecutionLog;
pub use record::{day_path, DayRecordWriter, DayRow, RECORD_HEADER};
pub use summary::DaySummary;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PersistenceError::InvalidDelimiter(";;".into());
        assert_eq!(
            format!("{err}"),
            "delimiter \";;\" must be a single ASCII character"
        );
    }
}
