mod delimited;
mod workbook;

pub use delimited::*;
pub use workbook::*;

use camino::Utf8Path;
use common::RowNumber;
use std::collections::HashMap;
use thiserror::Error;

/// A Result type specialized for reader operations.
pub type Result<T> = std::result::Result<T, ReaderError>;

/// One data row, already keyed by normalized header names. Values stay raw
/// strings; trimming and typing happen downstream in the validator.
#[derive(Clone, Debug)]
pub struct RowRecord {
    /// 1-based data-row index (header excluded).
    pub row_number: RowNumber,
    pub fields: HashMap<String, String>,
}

impl RowRecord {
    /// Trimmed field lookup; empty strings read as absent.
    pub fn get_trimmed(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Input formats the engine understands, selected by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    Delimited,
    Workbook,
}

impl FileFormat {
    pub fn from_path(path: &Utf8Path) -> Result<Self> {
        match path
            .extension()
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") => Ok(FileFormat::Delimited),
            Some("xlsx") | Some("xls") => Ok(FileFormat::Workbook),
            _ => Err(ReaderError::UnsupportedFormat(path.to_string())),
        }
    }
}

/// Lazy, forward-only record source over either input format.
///
/// At most one band of rows is resident at a time (plus the underlying
/// library's fixed buffers), independent of file size. The first yielded
/// record corresponds to `start_row`.
pub enum RowReader {
    Delimited(DelimitedReader),
    Workbook(WorkbookReader),
}

impl RowReader {
    /// `start_row` is 1-based; 1 means the first data row after the header.
    pub fn open(path: &Utf8Path, start_row: RowNumber) -> Result<Self> {
        match FileFormat::from_path(path)? {
            FileFormat::Delimited => Ok(RowReader::Delimited(DelimitedReader::open(
                path, start_row,
            )?)),
            FileFormat::Workbook => Ok(RowReader::Workbook(WorkbookReader::open(
                path, start_row,
            )?)),
        }
    }

    /// Normalized header names in file order.
    pub fn headers(&self) -> &[String] {
        match self {
            RowReader::Delimited(r) => r.headers(),
            RowReader::Workbook(r) => r.headers(),
        }
    }

    pub fn next_record(&mut self) -> Result<Option<RowRecord>> {
        match self {
            RowReader::Delimited(r) => r.next_record(),
            RowReader::Workbook(r) => r.next_record(),
        }
    }

    /// Collects up to `max` records. An empty result means exhaustion.
    /// The workbook side sizes its band loads to `max`, so chunked reads
    /// cost one filtered load per chunk.
    pub fn next_chunk(&mut self, max: usize) -> Result<Vec<RowRecord>> {
        match self {
            RowReader::Delimited(r) => {
                let mut chunk = Vec::with_capacity(max);
                while chunk.len() < max {
                    match r.next_record()? {
                        Some(record) => chunk.push(record),
                        None => break,
                    }
                }
                Ok(chunk)
            }
            RowReader::Workbook(r) => r.next_chunk(max),
        }
    }

    /// Dedicated counting pass: data rows only, header excluded. CSV scans
    /// end to end; workbooks read the sheet dimensions.
    pub fn count_data_rows(path: &Utf8Path) -> Result<u64> {
        match FileFormat::from_path(path)? {
            FileFormat::Delimited => DelimitedReader::count_data_rows(path),
            FileFormat::Workbook => WorkbookReader::count_data_rows(path),
        }
    }
}

/// Header names become mapping keys: lower-cased, runs of whitespace
/// collapsed to a single underscore.
pub fn normalize_header(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("could not read input file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed input: {0}")]
    Format(String),
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
}

impl From<csv::Error> for ReaderError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            match err.into_kind() {
                csv::ErrorKind::Io(io) => ReaderError::Io(io),
                other => ReaderError::Format(format!("{:?}", other)),
            }
        } else {
            ReaderError::Format(err.to_string())
        }
    }
}

impl From<calamine::Error> for ReaderError {
    fn from(err: calamine::Error) -> Self {
        match err {
            calamine::Error::Io(io) => ReaderError::Io(io),
            other => ReaderError::Format(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_lowercased_and_underscored() {
        assert_eq!(normalize_header("Employee Number"), "employee_number");
        assert_eq!(normalize_header("  Start   Date "), "start_date");
        assert_eq!(normalize_header("email"), "email");
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        let err = FileFormat::from_path(Utf8Path::new("imports/staff.pdf")).unwrap_err();
        assert!(matches!(err, ReaderError::UnsupportedFormat(_)));

        let err = FileFormat::from_path(Utf8Path::new("imports/noext")).unwrap_err();
        assert!(matches!(err, ReaderError::UnsupportedFormat(_)));
    }

    #[test]
    fn extension_dispatch_is_case_insensitive() {
        assert_eq!(
            FileFormat::from_path(Utf8Path::new("a.CSV")).unwrap(),
            FileFormat::Delimited
        );
        assert_eq!(
            FileFormat::from_path(Utf8Path::new("a.XLSX")).unwrap(),
            FileFormat::Workbook
        );
    }
}
