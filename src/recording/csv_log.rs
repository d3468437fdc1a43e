//! Durable CSV observation log
//!
//! Append-only. The header row is written exactly once, when the file is
//! first created; reopening an existing log validates its header instead.
//! Each row is encoded into its own buffer and written, flushed and synced
//! before it is acknowledged. A failed append truncates the file back to
//! where the row started, so no partial row is left behind and a lost row
//! is never re-emitted by a later append.
//!
//! `sync_data` blocks the calling task for the duration of the fsync.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, SinkError};
use crate::models::{ObservationRecord, ThresholdSet, BASE_COLUMNS};
use crate::recording::RecordSink;

pub struct CsvObservationLog {
    path: PathBuf,
    header: Vec<String>,
    /// Single writer; held only for the duration of one append
    file: Mutex<File>,
    rows_written: AtomicU64,
}

impl CsvObservationLog {
    /// Open (or create) the log at `path` for the given threshold schema.
    pub fn open(path: impl AsRef<Path>, thresholds: &ThresholdSet) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let header = thresholds.header();
        let unavailable = |source| ConfigError::DurableLogUnavailable {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(unavailable)?;
        }

        let existing_len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(unavailable(e)),
        };

        if existing_len > 0 {
            let found = read_header(&path)?;
            if found != header {
                return Err(ConfigError::HeaderMismatch {
                    path: path.clone(),
                    found,
                    expected: header,
                });
            }
            debug!("Reopened durable log {}", path.display());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(unavailable)?;

        if existing_len == 0 {
            encode_row(&header)
                .map_err(io::Error::from)
                .and_then(|bytes| append_whole(&mut file, &bytes))
                .map_err(unavailable)?;
            info!("Created CSV file: {}", path.display());
        }

        Ok(Self {
            path,
            header,
            file: Mutex::new(file),
            rows_written: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Rows appended by this process
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    fn append_row(&self, row: &[String]) -> Result<(), SinkError> {
        let bytes = encode_row(row).map_err(|e| SinkError::csv(&self.path, e))?;
        let mut file = self.file.lock();
        append_whole(&mut *file, &bytes).map_err(|e| SinkError::io(&self.path, e))?;
        self.rows_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One CSV line, quoted as needed, in a fresh buffer
fn encode_row(row: &[String]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(128));
    writer.write_record(row)?;
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// Storage the log appends to
trait AppendTarget: Write {
    fn end_offset(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl AppendTarget for File {
    fn end_offset(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Write `bytes` completely and durably, or leave the target as it was.
fn append_whole<T: AppendTarget>(target: &mut T, bytes: &[u8]) -> io::Result<()> {
    let start = target.end_offset()?;
    let written = target
        .write_all(bytes)
        .and_then(|_| target.flush())
        .and_then(|_| target.sync());

    if let Err(e) = written {
        if let Err(rollback) = target.truncate_to(start) {
            error!(
                "Could not roll back partial row at offset {}: {}",
                start, rollback
            );
        }
        return Err(e);
    }
    Ok(())
}

fn read_header(path: &Path) -> Result<Vec<String>, ConfigError> {
    let unreadable = |source| ConfigError::DurableLogUnreadable {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(unreadable)?;

    let mut first = csv::StringRecord::new();
    reader.read_record(&mut first).map_err(unreadable)?;
    Ok(first.iter().map(str::to_string).collect())
}

#[async_trait]
impl RecordSink for CsvObservationLog {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn destination(&self) -> String {
        self.path.display().to_string()
    }

    async fn append(&self, record: &ObservationRecord) -> Result<(), SinkError> {
        if record.flags.len() + BASE_COLUMNS.len() != self.header.len() {
            warn!(
                market_id = %record.market_id,
                "Record has {} threshold flags, log expects {}",
                record.flags.len(),
                self.header.len() - BASE_COLUMNS.len()
            );
        }
        self.append_row(&record.to_row())
    }

    async fn close(&self) {
        let file = self.file.lock();
        if let Err(e) = file.sync_all() {
            warn!("Failed to sync {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::evaluate;
    use crate::models::{Market, PricePair, ThresholdLevel};
    use crate::recording::reader::read_observations;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn market(id: &str) -> Market {
        Market {
            id: id.into(),
            name: format!("Market {id}"),
            fetch_target: id.into(),
        }
    }

    #[tokio::test]
    async fn test_header_written_once_across_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("arbitrage_data.csv");
        let thresholds = ThresholdSet::default();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        for i in 0..3 {
            let log = CsvObservationLog::open(&path, &thresholds).unwrap();
            let record = evaluate(PricePair::new(0.45, 0.5), &thresholds, &market("a"), ts);
            log.append(&record).await.unwrap();
            assert_eq!(log.rows_written(), 1, "reopen {i}");
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let header_lines = content
            .lines()
            .filter(|l| l.starts_with("Timestamp_UTC"))
            .count();
        assert_eq!(header_lines, 1);
        assert_eq!(content.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_rows_read_back_in_append_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let thresholds = ThresholdSet::default();
        let log = CsvObservationLog::open(&path, &thresholds).unwrap();

        let pairs = [(0.46, 0.50), (0.51, 0.51), (0.40, 0.45), (0.5, 0.5)];
        let mut appended = Vec::new();
        for (i, (y, n)) in pairs.into_iter().enumerate() {
            let ts = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, i as u32).unwrap();
            let record = evaluate(
                PricePair::new(y, n),
                &thresholds,
                &market(&format!("m{i}")),
                ts,
            );
            log.append(&record).await.unwrap();
            appended.push(record);
        }

        let read = read_observations(&path).unwrap();
        assert_eq!(read.header, thresholds.header());
        assert_eq!(read.rows.len(), appended.len());
        for (row, record) in read.rows.iter().zip(&appended) {
            assert_eq!(row.timestamp, record.timestamp);
            assert_eq!(row.market_id, record.market_id);
            assert_eq!(row.market_name, record.market_name);
            assert_eq!(row.yes_price, record.yes_price);
            assert_eq!(row.no_price, record.no_price);
            assert_eq!(row.price_sum, record.price_sum);
            assert_eq!(row.gap, record.gap);
            let flags: Vec<bool> = record.flags.iter().map(|f| f.below).collect();
            assert_eq!(row.flags, flags);
        }
    }

    /// Accepts `budget` bytes, then fails every write until refilled
    #[derive(Default)]
    struct FlakyDisk {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for FlakyDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AppendTarget for FlakyDisk {
        fn end_offset(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_append_leaves_no_partial_or_replayed_row() {
        let first = encode_row(&["a".to_string(), "0.5000".to_string()]).unwrap();
        let lost = encode_row(&["b".to_string(), "0.4000".to_string()]).unwrap();
        let third = encode_row(&["c".to_string(), "0.3000".to_string()]).unwrap();

        let mut disk = FlakyDisk {
            budget: first.len() + 3,
            ..Default::default()
        };
        append_whole(&mut disk, &first).unwrap();
        assert!(append_whole(&mut disk, &lost).is_err());
        assert_eq!(disk.data, first);

        disk.budget = usize::MAX;
        append_whole(&mut disk, &third).unwrap();
        assert_eq!(String::from_utf8(disk.data).unwrap(), "a,0.5000\nc,0.3000\n");
    }

    #[test]
    fn test_schema_change_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        CsvObservationLog::open(&path, &ThresholdSet::default()).unwrap();

        let narrower = ThresholdSet::new(vec![ThresholdLevel::new("primary", 1.0)]);
        let err = CsvObservationLog::open(&path, &narrower).err().unwrap();
        assert!(matches!(err, ConfigError::HeaderMismatch { .. }));
    }

    #[tokio::test]
    async fn test_market_names_with_commas_are_quoted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let thresholds = ThresholdSet::default();
        let log = CsvObservationLog::open(&path, &thresholds).unwrap();

        let mut m = market("x");
        m.name = "Rates cut, then hiked".into();
        let record = evaluate(PricePair::new(0.5, 0.49), &thresholds, &m, Utc::now());
        log.append(&record).await.unwrap();

        let read = read_observations(&path).unwrap();
        assert_eq!(read.rows[0].market_name, "Rates cut, then hiked");
    }
}
