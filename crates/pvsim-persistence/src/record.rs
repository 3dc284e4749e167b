//! ---
//! pvsim_section: "04-persistence"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Per-day record files and execution-time log."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use pvsim_common::SignConvention;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::summary::DaySummary;
use crate::{PersistenceError, Result};

/// Column names of every day record.
pub const RECORD_HEADER: [&str; 4] = ["timestamp", "meter", "pv", "sum"];

const TEMP_SUFFIX: &str = ".part";

/// One persisted row. `timestamp` is the iteration number within the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRow {
    /// Iteration the reading belongs to.
    pub timestamp: u32,
    /// Consumption, signed according to the configured convention.
    pub meter: i64,
    /// Photovoltaic output.
    pub pv: i64,
    /// `meter + pv` after signing.
    pub sum: i64,
}

impl DayRow {
    /// Combine a raw meter reading and a PV value under `convention`.
    pub fn combine(iteration: u32, meter: i64, pv: i64, convention: SignConvention) -> Self {
        let meter = match convention {
            SignConvention::Positive => meter,
            SignConvention::Negated => -meter,
        };
        Self {
            timestamp: iteration,
            meter,
            pv,
            sum: meter + pv,
        }
    }
}

/// Final location of day `day` for the output template
/// (`out/output.csv` gives `out/output_day3.csv`).
pub fn day_path(template: &Path, day: u64) -> PathBuf {
    let stem = template
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_owned());
    let name = match template.extension() {
        Some(ext) => format!("{}_day{}.{}", stem, day, ext.to_string_lossy()),
        None => format!("{}_day{}", stem, day),
    };
    template.with_file_name(name)
}

fn temp_path(final_path: &Path) -> PathBuf {
    let mut name: OsString = final_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    final_path.with_file_name(name)
}

/// Sink that can drop bytes written past a known-good length.
trait Rewind: Write {
    fn rewind_to(&mut self, len: u64) -> io::Result<()>;
}

impl Rewind for File {
    fn rewind_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

/// Write `bytes` after the committed prefix. A failed write is cut back to
/// `committed` so a retried row never lands twice.
fn commit<W: Rewind>(sink: &mut W, committed: &mut u64, bytes: &[u8]) -> io::Result<()> {
    match sink.write_all(bytes).and_then(|()| sink.flush()) {
        Ok(()) => {
            *committed += bytes.len() as u64;
            Ok(())
        }
        Err(err) => {
            sink.rewind_to(*committed)?;
            Err(err)
        }
    }
}

/// Writer for one open day. Rows land in `<final>.part` and are written
/// through as they arrive; [`DayRecordWriter::finalize`] renames the file into place.
pub struct DayRecordWriter {
    day: u64,
    final_path: PathBuf,
    temp_path: PathBuf,
    file: File,
    delimiter: u8,
    committed: u64,
    summary: DaySummary,
    last_iteration: Option<u32>,
}

impl DayRecordWriter {
    /// Open the temporary file for `day` and write the header.
    pub fn open(template: &Path, day: u64, delimiter: u8) -> Result<Self> {
        let final_path = day_path(template, day);
        let temp_path = temp_path(&final_path);
        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if final_path.exists() {
            warn!(day, path = %final_path.display(), "record for day already exists and will be replaced");
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = Self {
            day,
            summary: DaySummary::new(day, final_path.clone()),
            final_path,
            temp_path,
            file,
            delimiter,
            committed: 0,
            last_iteration: None,
        };
        let header = writer.encode(|csv| csv.write_record(RECORD_HEADER))?;
        commit(&mut writer.file, &mut writer.committed, &header)?;
        debug!(day, path = %writer.temp_path.display(), "day record opened");
        Ok(writer)
    }

    fn encode<F>(&self, write: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&mut csv::Writer<Vec<u8>>) -> csv::Result<()>,
    {
        let mut csv = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_writer(Vec::new());
        write(&mut csv)?;
        csv.into_inner()
            .map_err(|err| PersistenceError::Io(err.into_error()))
    }

    /// Day this record belongs to.
    pub fn day(&self) -> u64 {
        self.day
    }

    /// Highest iteration written so far.
    pub fn last_iteration(&self) -> Option<u32> {
        self.last_iteration
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.summary.rows
    }

    /// Temporary path currently being written.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Path the record becomes visible under once finalized.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Append one row. On error nothing of the row stays in the file.
    pub fn append(&mut self, row: &DayRow) -> Result<()> {
        let bytes = self.encode(|csv| csv.serialize(row))?;
        commit(&mut self.file, &mut self.committed, &bytes)?;
        self.summary.record(row);
        self.last_iteration = Some(
            self.last_iteration
                .map_or(row.timestamp, |last| last.max(row.timestamp)),
        );
        Ok(())
    }

    /// Sync the temporary file and rename it to its final name.
    ///
    /// On error the record stays open and finalization can be attempted again.
    pub fn finalize(&mut self) -> Result<DaySummary> {
        self.file.sync_all()?;
        fs::rename(&self.temp_path, &self.final_path)?;
        debug!(day = self.day, path = %self.final_path.display(), "day record finalized");
        Ok(self.summary.clone())
    }

    /// Drop the partial record and remove its temporary file.
    pub fn abandon(self) -> Result<()> {
        let Self {
            day,
            temp_path,
            file,
            ..
        } = self;
        drop(file);
        match fs::remove_file(&temp_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        debug!(day, path = %temp_path.display(), "partial day record removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn day_paths_follow_template() {
        assert_eq!(
            day_path(Path::new("out/output.csv"), 3),
            PathBuf::from("out/output_day3.csv")
        );
        assert_eq!(day_path(Path::new("records"), 0), PathBuf::from("records_day0"));
        assert_eq!(
            temp_path(Path::new("out/output_day3.csv")),
            PathBuf::from("out/output_day3.csv.part")
        );
    }

    #[test]
    fn sign_conventions() {
        let positive = DayRow::combine(5, 1200, 300, SignConvention::Positive);
        assert_eq!((positive.meter, positive.sum), (1200, 1500));
        let negated = DayRow::combine(5, 1200, 300, SignConvention::Negated);
        assert_eq!((negated.meter, negated.sum), (-1200, -900));
    }

    /// Accepts `budget` bytes, then fails mid-write.
    struct ShortSink {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for ShortSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Rewind for ShortSink {
        fn rewind_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn failed_row_is_cut_back_and_retry_writes_it_once() {
        let mut sink = ShortSink {
            data: Vec::new(),
            budget: 9,
        };
        let mut committed = 0;
        commit(&mut sink, &mut committed, b"1;10;0;10\n").unwrap_err();
        assert!(sink.data.is_empty());
        assert_eq!(committed, 0);

        sink.budget = usize::MAX;
        commit(&mut sink, &mut committed, b"1;10;0;10\n").unwrap();
        commit(&mut sink, &mut committed, b"2;20;0;20\n").unwrap();
        assert_eq!(sink.data, b"1;10;0;10\n2;20;0;20\n");
        assert_eq!(committed, 20);
    }

    #[test]
    fn rows_are_visible_in_temp_file_before_finalize() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("output.csv");
        let mut writer = DayRecordWriter::open(&template, 0, b';').unwrap();
        writer
            .append(&DayRow::combine(1, 10, 0, SignConvention::Positive))
            .unwrap();

        let partial = fs::read_to_string(writer.temp_path()).unwrap();
        assert_eq!(partial, "timestamp;meter;pv;sum\n1;10;0;10\n");
        assert!(!writer.final_path().exists());
    }

    #[test]
    fn abandon_removes_partial_file() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("output.csv");
        let writer = DayRecordWriter::open(&template, 4, b',').unwrap();
        let temp = writer.temp_path().to_path_buf();
        assert!(temp.exists());
        writer.abandon().unwrap();
        assert!(!temp.exists());
        assert!(!day_path(&template, 4).exists());
    }

    #[test]
    fn last_iteration_tracks_maximum() {
        let dir = tempdir().unwrap();
        let mut writer = DayRecordWriter::open(&dir.path().join("o.csv"), 1, b';').unwrap();
        assert_eq!(writer.last_iteration(), None);
        writer
            .append(&DayRow::combine(7, 1, 1, SignConvention::Positive))
            .unwrap();
        writer
            .append(&DayRow::combine(3, 1, 1, SignConvention::Positive))
            .unwrap();
        assert_eq!(writer.last_iteration(), Some(7));
        assert_eq!(writer.rows(), 2);
    }
}
