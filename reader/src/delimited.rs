use crate::{Result, RowRecord, normalize_header};
use camino::Utf8Path;
use common::RowNumber;
use std::collections::HashMap;
use std::fs::File;

/// Streaming CSV source. RFC-4180 quoting via the `csv` crate; rows with
/// more or fewer fields than the header still yield a mapping, with the
/// missing fields empty.
pub struct DelimitedReader {
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<File>,
    next_row: RowNumber,
}

impl DelimitedReader {
    pub fn open(path: &Utf8Path, start_row: RowNumber) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path.as_std_path())?;

        let headers = csv_reader
            .headers()?
            .iter()
            .map(normalize_header)
            .collect::<Vec<_>>();

        let mut records = csv_reader.into_records();

        // Skip to the requested offset. The skipped rows still stream
        // through the parser one at a time, so memory stays flat.
        for _ in 1..start_row {
            match records.next() {
                Some(record) => {
                    record?;
                }
                None => break,
            }
        }

        Ok(Self {
            headers,
            records,
            next_row: start_row,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn next_record(&mut self) -> Result<Option<RowRecord>> {
        let Some(record) = self.records.next() else {
            return Ok(None);
        };
        let record = record?;

        let mut fields = HashMap::with_capacity(self.headers.len());
        for (i, header) in self.headers.iter().enumerate() {
            let value = record.get(i).unwrap_or_default();
            fields.insert(header.clone(), value.to_string());
        }

        let row_number = self.next_row;
        self.next_row += 1;
        Ok(Some(RowRecord { row_number, fields }))
    }

    /// End-to-end scan counting data rows. Blank trailing lines are not
    /// records and do not count.
    pub fn count_data_rows(path: &Utf8Path) -> Result<u64> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path.as_std_path())?;

        let mut count = 0u64;
        for record in csv_reader.records() {
            record?;
            count += 1;
        }
        Ok(count)
    }
}
