//! Append-only CSV measurement log.
//!
//! Layout of `<device>.csv` (or `<device>/_images.csv`):
//!
//! ```text
//! # datetime,s,DEG C,-,
//! time_abs,time_rel,Temperature,Operating point,
//! 2024-03-01 12:30:05.123+01:00,0.0,20.5,42.0,
//! ```
//!
//! Every line carries a trailing delimiter. Records are flushed one by one so
//! the file on disk always ends with a complete row.

use crate::error::{AppResult, DaqError};
use crate::measurement::{format_timestamp, MeasurementRecord};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Writer for one device's measurement log.
pub struct MeasurementLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    columns: usize,
    rows: usize,
}

impl MeasurementLog {
    /// Create the log and write its two header lines.
    ///
    /// Fails with [`DaqError::OutputExists`] if the file is already there.
    pub fn create<S: AsRef<str>>(path: &Path, units: &[S], columns: &[S]) -> AppResult<Self> {
        if units.len() != columns.len() {
            return Err(DaqError::Configuration(format!(
                "{} units given for {} columns",
                units.len(),
                columns.len()
            )));
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => DaqError::OutputExists(path.to_path_buf()),
                _ => DaqError::Io(e),
            })?;

        let writer = csv::WriterBuilder::new()
            .flexible(true)
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);

        let mut log = Self {
            path: path.to_path_buf(),
            writer,
            columns: columns.len(),
            rows: 0,
        };

        let units_row = ["# datetime", "s"]
            .into_iter()
            .chain(units.iter().map(|unit| unit.as_ref()));
        log.write_line(units_row)?;

        let header_row = ["time_abs", "time_rel"]
            .into_iter()
            .chain(columns.iter().map(|column| column.as_ref()));
        log.write_line(header_row)?;

        tracing::debug!(path = %log.path.display(), columns = log.columns, "Measurement log created");
        Ok(log)
    }

    /// Append one record and flush it.
    pub fn append(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        if record.fields.len() != self.columns {
            return Err(DaqError::Configuration(format!(
                "record has {} fields, log {} expects {}",
                record.fields.len(),
                self.path.display(),
                self.columns
            )));
        }

        let time_abs = format_timestamp(&record.time_abs);
        let time_rel = format!("{:?}", record.time_rel);
        let row = [time_abs.as_str(), time_rel.as_str()]
            .into_iter()
            .chain(record.fields.iter().map(String::as_str));
        self.write_line(row)?;
        self.rows += 1;
        Ok(())
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the log, as referenced from the archive.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Number of data rows written so far.
    pub fn rows_written(&self) -> usize {
        self.rows
    }

    fn write_line<'a>(&mut self, fields: impl Iterator<Item = &'a str>) -> AppResult<()> {
        // The trailing empty field yields the trailing delimiter.
        self.writer.write_record(fields.chain(std::iter::once("")))?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Timestamp;
    use chrono::{FixedOffset, TimeZone};

    fn t0() -> Timestamp {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 8, 0, 0)
            .unwrap()
    }

    #[test]
    fn header_and_rows_end_with_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Eurotherm.csv");
        let mut log =
            MeasurementLog::create(&path, &["DEG C", "-"], &["Temperature", "Operating point"])
                .unwrap();
        log.append(&MeasurementRecord::from_values(t0(), 0.0, &[20.5, f64::NAN]))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(
            lines,
            [
                "# datetime,s,DEG C,-,",
                "time_abs,time_rel,Temperature,Operating point,",
                "2024-03-01 08:00:00.000+00:00,0.0,20.5,NaN,",
            ]
        );
        assert_eq!(log.rows_written(), 1);
        assert_eq!(log.file_name(), "Eurotherm.csv");
    }

    #[test]
    fn existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vifcon.csv");
        std::fs::write(&path, "previous run\n").unwrap();

        let err = MeasurementLog::create(&path, &["W"], &["IWP"]).err().unwrap();
        assert!(matches!(err, DaqError::OutputExists(ref p) if p == &path));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous run\n");
    }

    #[test]
    fn field_count_must_match_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = MeasurementLog::create(&dir.path().join("x.csv"), &["W"], &["IWP"]).unwrap();
        let record = MeasurementRecord::from_values(t0(), 1.0, &[1.0, 2.0]);
        assert!(log.append(&record).is_err());
        assert_eq!(log.rows_written(), 0);
    }

    #[test]
    fn fields_with_commas_are_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.csv");
        let mut log = MeasurementLog::create(&path, &["filename"], &["img-name"]).unwrap();
        log.append(&MeasurementRecord::new(t0(), 0.5, vec!["a,b.jpg".to_string()]))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with(",0.5,\"a,b.jpg\",\n"));
    }
}
