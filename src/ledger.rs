//! CSV persistence of the aggregation store.
//!
//! ```text
//! Date,9:00,10:00,...,21:00
//! 2024-06-01,3,7,5,0,2,9,4,1,0,0,6,3,2
//! ```
//!
//! Loading is tolerant: a missing file or an unrecognised header yields an
//! empty store, unreadable cells read as 0. Saving rewrites the whole file
//! through a temporary sibling that is renamed over the target.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::hours::{self, HOURS_PER_DAY};
use crate::store::{AggregationStore, DayRecord};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger CSV error for {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Durable home of the hourly counts.
pub trait Ledger {
    fn load(&self) -> Result<AggregationStore, LedgerError>;
    fn save(&mut self, store: &AggregationStore) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone)]
pub struct CsvLedger {
    path: PathBuf,
}

impl CsvLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_err(&self, source: io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn csv_err(&self, source: csv::Error) -> LedgerError {
        LedgerError::Csv {
            path: self.path.clone(),
            source,
        }
    }
}

pub fn header() -> Vec<String> {
    std::iter::once("Date".to_string())
        .chain(hours::operating_hours().map(|h| format!("{h}:00")))
        .collect()
}

/// Writes the store as CSV text.
pub fn write_rows<W: io::Write>(store: &AggregationStore, out: W) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(header())?;
    for (date, record) in store.sorted_rows() {
        let mut row = Vec::with_capacity(HOURS_PER_DAY + 1);
        row.push(date.format(DATE_FORMAT).to_string());
        row.extend(record.hours().map(|(_, count)| count.to_string()));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Parses CSV text into a store, tolerating damage.
pub fn read_rows<R: io::Read>(input: R) -> Result<AggregationStore, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let mut records = reader.records();

    let mut store = AggregationStore::new();
    let Some(first) = records.next() else {
        info!("Ledger is empty, starting with no history");
        return Ok(store);
    };
    let first = match first {
        Ok(first) => first,
        Err(err) if err.is_io_error() => return Err(err),
        Err(err) => {
            warn!("Ledger header unreadable, starting with no history: {err}");
            return Ok(store);
        }
    };
    if !header_matches(&first) {
        warn!(header = ?first, "Ledger header not recognised, starting with no history");
        return Ok(store);
    }

    for record in records {
        let record = match record {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(err),
            Err(err) => {
                warn!("Skipping unreadable ledger row: {err}");
                continue;
            }
        };
        // date plus at least one hour cell
        if record.len() < 2 {
            continue;
        }
        let raw_date = record.get(0).unwrap_or_default();
        let Ok(date) = NaiveDate::parse_from_str(raw_date, DATE_FORMAT) else {
            warn!(date = raw_date, "Skipping ledger row with unparseable date");
            continue;
        };
        let day = DayRecord::from_columns(
            record.iter().skip(1).map(|cell| cell.parse::<u32>().unwrap_or(0)),
        );
        store.insert_day(date, day);
    }
    Ok(store)
}

/// Spreadsheets may save trailing delimiters, so empty cells past the last
/// hour column are accepted.
fn header_matches(record: &csv::StringRecord) -> bool {
    let expected = header();
    record.len() >= expected.len()
        && record
            .iter()
            .zip(expected.iter())
            .all(|(got, want)| got.eq_ignore_ascii_case(want))
        && record.iter().skip(expected.len()).all(str::is_empty)
}

impl Ledger for CsvLedger {
    fn load(&self) -> Result<AggregationStore, LedgerError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("No existing {} found, will create it", self.path.display());
                return Ok(AggregationStore::new());
            }
            Err(err) => return Err(self.io_err(err)),
        };
        let store = read_rows(io::BufReader::new(file)).map_err(|e| self.csv_err(e))?;
        info!(days = store.len(), "Loaded existing counts from {}", self.path.display());
        Ok(store)
    }

    fn save(&mut self, store: &AggregationStore) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let tmp_path = self.tmp_path();
        let file = fs::File::create(&tmp_path).map_err(|e| self.io_err(e))?;
        let mut out = io::BufWriter::new(file);
        write_rows(store, &mut out).map_err(|e| self.csv_err(e))?;
        let file = out
            .into_inner()
            .map_err(|e| self.io_err(e.into_error()))?;
        file.sync_all().map_err(|e| self.io_err(e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e))?;
        debug!(days = store.len(), "Ledger updated: {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sample_store() -> AggregationStore {
        let mut store = AggregationStore::new();
        for (hour, count) in [(9, 3), (10, 7), (11, 5), (14, 9), (21, 2)] {
            store.set_hour(date(2024, 6, 1), hour, count).unwrap();
        }
        store.set_hour(date(2024, 5, 31), 12, 1).unwrap();
        store.touch_day(date(2024, 6, 2));
        store
    }

    fn render(store: &AggregationStore) -> String {
        let mut buf = Vec::new();
        write_rows(store, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn writes_padded_sorted_rows() {
        let text = render(&sample_store());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Date,9:00,10:00,11:00,12:00,13:00,14:00,15:00,16:00,17:00,18:00,19:00,20:00,21:00"
        );
        assert_eq!(lines[1], "2024-05-31,0,0,0,1,0,0,0,0,0,0,0,0,0");
        assert_eq!(lines[2], "2024-06-01,3,7,5,0,0,9,0,0,0,0,0,0,2");
        assert_eq!(lines[3], "2024-06-02,0,0,0,0,0,0,0,0,0,0,0,0,0");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn save_then_load_reproduces_store() {
        let dir = tempdir().unwrap();
        let mut ledger = CsvLedger::new(dir.path().join("data.csv"));
        let store = sample_store();

        ledger.save(&store).unwrap();
        assert_eq!(ledger.load().unwrap(), store);
    }

    #[test]
    fn repeated_saves_are_byte_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let mut ledger = CsvLedger::new(&path);
        let store = sample_store();

        ledger.save(&store).unwrap();
        let first = fs::read(&path).unwrap();
        ledger.save(&store).unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn save_leaves_no_tmp_file_behind() {
        let dir = tempdir().unwrap();
        let mut ledger = CsvLedger::new(dir.path().join("nested").join("data.csv"));
        ledger.save(&sample_store()).unwrap();

        assert!(ledger.path().exists());
        assert!(!dir.path().join("nested").join("data.csv.tmp").exists());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let ledger = CsvLedger::new(dir.path().join("absent.csv"));
        assert!(ledger.load().unwrap().is_empty());
    }

    #[test]
    fn empty_file_loads_empty() {
        let store = read_rows("".as_bytes()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn unrecognised_header_loads_empty() {
        let text = "when,morning,evening\n2024-06-01,1,2\n";
        assert!(read_rows(text.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn bad_cells_read_as_zero() {
        let text = "Date,9:00,10:00,11:00,12:00,13:00,14:00,15:00,16:00,17:00,18:00,19:00,20:00,21:00\n\
                    2024-06-01,4,abc,-3,,7.5,2\n";
        let store = read_rows(text.as_bytes()).unwrap();
        let day = date(2024, 6, 1);
        assert_eq!(store.get_hour(day, 9), 4);
        assert_eq!(store.get_hour(day, 10), 0);
        assert_eq!(store.get_hour(day, 11), 0);
        assert_eq!(store.get_hour(day, 12), 0);
        assert_eq!(store.get_hour(day, 13), 0);
        assert_eq!(store.get_hour(day, 14), 2);
        assert_eq!(store.get_hour(day, 21), 0);
    }

    #[test]
    fn short_and_undated_rows_are_skipped() {
        let text = "Date,9:00,10:00,11:00,12:00,13:00,14:00,15:00,16:00,17:00,18:00,19:00,20:00,21:00\n\
                    2024-06-01\n\
                    yesterday,1,2,3\n\
                    2024-06-02,1\n";
        let store = read_rows(text.as_bytes()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_hour(date(2024, 6, 2), 9), 1);
    }

    #[test]
    fn non_utf8_header_loads_empty() {
        let mut bytes = b"Date,9:00\xff\n".to_vec();
        bytes.extend_from_slice(b"2024-06-01,1\n");
        assert!(read_rows(bytes.as_slice()).unwrap().is_empty());
    }

    #[test]
    fn extra_cells_are_ignored() {
        let text = "Date,9:00,10:00,11:00,12:00,13:00,14:00,15:00,16:00,17:00,18:00,19:00,20:00,21:00\n\
                    2024-06-01,1,1,1,1,1,1,1,1,1,1,1,1,1,99,99\n";
        let store = read_rows(text.as_bytes()).unwrap();
        assert_eq!(store.day(date(2024, 6, 1)).unwrap().total(), 13);
    }

    #[test]
    fn trailing_delimiter_header_keeps_rows() {
        let text = "Date,9:00,10:00,11:00,12:00,13:00,14:00,15:00,16:00,17:00,18:00,19:00,20:00,21:00,\n\
                    2024-06-01,3,7,5,0,0,9,0,0,0,0,0,0,2,\n";
        let store = read_rows(text.as_bytes()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_hour(date(2024, 6, 1), 10), 7);
        assert_eq!(store.get_hour(date(2024, 6, 1), 21), 2);
    }

    #[test]
    fn header_with_extra_named_column_loads_empty() {
        let text = "Date,9:00,10:00,11:00,12:00,13:00,14:00,15:00,16:00,17:00,18:00,19:00,20:00,21:00,22:00\n\
                    2024-06-01,1,1,1,1,1,1,1,1,1,1,1,1,1,1\n";
        assert!(read_rows(text.as_bytes()).unwrap().is_empty());
    }
}
