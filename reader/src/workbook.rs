use crate::{ReaderError, Result, RowRecord, normalize_header};
use calamine::{Data, Range, Reader};
use camino::{Utf8Path, Utf8PathBuf};
use common::RowNumber;
use std::collections::{HashMap, VecDeque};

/// Band size for record-at-a-time streaming, where no caller-requested
/// range exists to size the load by. Chunked reads size their own bands.
const DEFAULT_BAND_ROWS: usize = 256;

/// Workbook source (`.xlsx`/`.xls`), first sheet only.
///
/// Rows are pulled in bands sized to the requested range: each band
/// re-opens the workbook, copies out just those rows, and drops the parsed
/// sheet before the next load, so a file read in chunks of C costs one
/// filtered load per chunk and only the current band stays resident. Cell
/// values are the calculated values the workbook carries (formulas come
/// back as their cached results), dates rendered `YYYY-MM-DD`.
pub struct WorkbookReader {
    path: Utf8PathBuf,
    headers: Vec<String>,
    total_data_rows: u64,
    band: VecDeque<RowRecord>,
    /// Next data row to fetch into a band, 1-based.
    next_row: RowNumber,
}

impl WorkbookReader {
    pub fn open(path: &Utf8Path, start_row: RowNumber) -> Result<Self> {
        // Single range-1 load: the header row and the sheet dimensions.
        let sheet = open_first_sheet(path)?;
        let headers = sheet
            .rows()
            .next()
            .map(|row| row.iter().map(|c| normalize_header(&cell_to_string(c))).collect())
            .unwrap_or_default();
        let total_data_rows = (sheet.height() as u64).saturating_sub(1);
        drop(sheet);

        Ok(Self {
            path: path.to_path_buf(),
            headers,
            total_data_rows,
            band: VecDeque::new(),
            next_row: start_row.max(1),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn next_record(&mut self) -> Result<Option<RowRecord>> {
        self.pull(DEFAULT_BAND_ROWS)
    }

    /// Collects up to `max` records, loading bands no larger than the
    /// amount still wanted. Starting from an empty band this is exactly
    /// one filtered load per call.
    pub fn next_chunk(&mut self, max: usize) -> Result<Vec<RowRecord>> {
        let mut chunk = Vec::with_capacity(max);
        while chunk.len() < max {
            match self.pull(max - chunk.len())? {
                Some(record) => chunk.push(record),
                None => break,
            }
        }
        Ok(chunk)
    }

    /// Sheet dimensions, header excluded. No row data is retained.
    pub fn count_data_rows(path: &Utf8Path) -> Result<u64> {
        let sheet = open_first_sheet(path)?;
        Ok((sheet.height() as u64).saturating_sub(1))
    }

    fn pull(&mut self, band_rows: usize) -> Result<Option<RowRecord>> {
        if self.band.is_empty() {
            self.load_band(band_rows.max(1))?;
        }
        Ok(self.band.pop_front())
    }

    /// Loads the next `band_rows` data rows. The workbook is opened, the
    /// band copied out, and the parsed sheet dropped again before
    /// returning, so the resident window is one band regardless of sheet
    /// size.
    fn load_band(&mut self, band_rows: usize) -> Result<()> {
        if self.next_row > self.total_data_rows {
            return Ok(());
        }

        let sheet = open_first_sheet(&self.path)?;

        // Data row r sits at in-range index r; index 0 is the header.
        let rows = sheet
            .rows()
            .skip(self.next_row as usize)
            .take(band_rows);

        for row in rows {
            let mut fields = HashMap::with_capacity(self.headers.len());
            for (i, header) in self.headers.iter().enumerate() {
                let value = row.get(i).map(cell_to_string).unwrap_or_default();
                fields.insert(header.clone(), value);
            }
            self.band.push_back(RowRecord {
                row_number: self.next_row,
                fields,
            });
            self.next_row += 1;
        }

        Ok(())
    }
}

fn open_first_sheet(path: &Utf8Path) -> Result<Range<Data>> {
    let mut sheets = calamine::open_workbook_auto(path.as_std_path())?;
    let name = sheets
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| ReaderError::Format(format!("workbook has no sheets: {}", path)))?;
    Ok(sheets.worksheet_range(&name)?)
}

/// Calculated-value extraction. Whole floats print without a fraction so
/// numeric identifiers survive the trip through the workbook untouched.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        Data::DateTimeIso(s) => s.chars().take(10).collect(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => e.to_string(),
    }
}
