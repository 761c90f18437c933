//! Durable backing for recorded exchanges.
//!
//! The file backend is a JSON Lines log: one [`Exchange`] per line, appended as
//! exchanges are recorded and rewritten wholesale (temp file + rename) when the
//! store is snapshotted.

use super::types::Exchange;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on recording log {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode exchange: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt record in {path:?} at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Backend-agnostic storage for the exchange log.
///
/// Synchronous on purpose: callers on the async path wrap appends in
/// `spawn_blocking`.
pub trait ExchangeLog: Send + Sync {
    /// Durably append one exchange. Returns only once the record is written.
    fn append(&self, exchange: &Exchange) -> Result<(), PersistenceError>;

    /// Read every persisted exchange in log order.
    fn load(&self) -> Result<Vec<Exchange>, PersistenceError>;

    /// Replace the whole log with `exchanges`.
    fn snapshot(&self, exchanges: &[Arc<Exchange>]) -> Result<(), PersistenceError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Log kept in memory only. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryExchangeLog {
    records: Mutex<Vec<Exchange>>,
}

impl MemoryExchangeLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExchangeLog for MemoryExchangeLog {
    fn append(&self, exchange: &Exchange) -> Result<(), PersistenceError> {
        self.records.lock().push(exchange.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<Exchange>, PersistenceError> {
        Ok(self.records.lock().clone())
    }

    fn snapshot(&self, exchanges: &[Arc<Exchange>]) -> Result<(), PersistenceError> {
        *self.records.lock() = exchanges.iter().map(|e| Exchange::clone(e)).collect();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// JSON Lines log on the local filesystem.
pub struct FileExchangeLog {
    path: PathBuf,
    fsync: bool,
    /// Lazily opened append handle; reset after a snapshot replaces the file.
    writer: Mutex<Option<File>>,
}

impl FileExchangeLog {
    pub fn new(path: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            path: path.into(),
            fsync,
            writer: Mutex::new(None),
        }
    }

    fn open_append(&self) -> Result<File, PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        self.repair_tail(&mut file)
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        Ok(file)
    }

    /// Make sure the next record starts on a fresh line.
    ///
    /// An unterminated last line that parses only lacks its newline. One that
    /// does not parse is a write that never completed, and is cut off.
    fn repair_tail(&self, file: &mut File) -> std::io::Result<()> {
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(());
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            return Ok(());
        }

        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;
        let (_, tail) = split_tail(&data);
        if serde_json::from_slice::<Exchange>(tail).is_ok() {
            return file.write_all(b"\n");
        }
        warn!(
            "Discarding {} bytes of an incomplete record at the end of {:?}",
            tail.len(),
            self.path
        );
        file.set_len(len - tail.len() as u64)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl ExchangeLog for FileExchangeLog {
    fn append(&self, exchange: &Exchange) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(exchange)?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        let mut file = match writer.take() {
            Some(file) => file,
            None => self.open_append()?,
        };

        let start = file.metadata().map(|meta| meta.len());
        let written = file.write_all(&line).and_then(|()| file.flush());
        let synced = written.and_then(|()| if self.fsync { file.sync_data() } else { Ok(()) });
        if let Err(e) = synced {
            // Cut off whatever part of the record reached the file. The handle is
            // dropped either way, and the next append reopens and repairs it.
            if let Ok(start) = start {
                if let Err(trunc) = file.set_len(start) {
                    warn!("Failed to roll back partial record in {:?}: {}", self.path, trunc);
                }
            }
            return Err(PersistenceError::io(&self.path, e));
        }
        *writer = Some(file);
        Ok(())
    }

    fn load(&self) -> Result<Vec<Exchange>, PersistenceError> {
        if !self.path.exists() {
            debug!("Recording log {:?} does not exist, starting fresh", self.path);
            return Ok(Vec::new());
        }

        let data = fs::read(&self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        let (complete, tail) = split_tail(&data);

        let mut exchanges = Vec::new();
        for (idx, line) in complete.split(|b| *b == b'\n').enumerate() {
            if line.trim_ascii().is_empty() {
                continue;
            }
            let exchange: Exchange =
                serde_json::from_slice(line).map_err(|source| PersistenceError::Corrupt {
                    path: self.path.clone(),
                    line: idx + 1,
                    source,
                })?;
            exchanges.push(exchange);
        }

        // A record is only acknowledged once its newline is written.
        if !tail.trim_ascii().is_empty() {
            match serde_json::from_slice::<Exchange>(tail) {
                Ok(exchange) => exchanges.push(exchange),
                Err(e) => warn!(
                    "Ignoring incomplete last record in {:?} ({} bytes): {}",
                    self.path,
                    tail.len(),
                    e
                ),
            }
        }

        info!(
            "Loaded {} recorded exchanges from {:?}",
            exchanges.len(),
            self.path
        );
        Ok(exchanges)
    }

    fn snapshot(&self, exchanges: &[Arc<Exchange>]) -> Result<(), PersistenceError> {
        // Hold the writer for the whole rewrite so no append lands in the old file.
        let mut writer = self.writer.lock();
        let tmp_path = self.temp_path();

        let tmp = File::create(&tmp_path).map_err(|e| PersistenceError::io(&tmp_path, e))?;
        let mut out = BufWriter::new(tmp);
        for exchange in exchanges {
            serde_json::to_writer(&mut out, exchange.as_ref())?;
            out.write_all(b"\n")
                .map_err(|e| PersistenceError::io(&tmp_path, e))?;
        }
        let tmp = out
            .into_inner()
            .map_err(|e| PersistenceError::io(&tmp_path, e.into_error()))?;
        tmp.sync_all()
            .map_err(|e| PersistenceError::io(&tmp_path, e))?;

        fs::rename(&tmp_path, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        *writer = None;

        info!(
            "Snapshotted {} exchanges to {:?}",
            exchanges.len(),
            self.path
        );
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Split `data` into its newline-terminated part and the unterminated rest.
fn split_tail(data: &[u8]) -> (&[u8], &[u8]) {
    match data.iter().rposition(|b| *b == b'\n') {
        Some(pos) => (&data[..pos], &data[pos + 1..]),
        None => (&[], data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FingerprintConfig;
    use crate::recording::fingerprint::fingerprint;
    use crate::recording::types::{RecordedRequest, RecordedResponse};
    use chrono::Utc;

    fn exchange(target: &str, index: usize, body: &[u8]) -> Exchange {
        let request = RecordedRequest::new("GET", target);
        Exchange {
            fingerprint: fingerprint(&request, &FingerprintConfig::default()),
            sequence_index: index,
            recorded_at: Utc::now(),
            request,
            response: RecordedResponse::new(200).with_body(body.to_vec()),
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileExchangeLog::new(dir.path().join("none.jsonl"), true);
        assert!(log.load().unwrap().is_empty());
    }

    #[test]
    fn test_append_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileExchangeLog::new(dir.path().join("rec.jsonl"), true);

        let first = exchange("/a", 0, b"one");
        let second = exchange("/a", 1, &[0xff, 0xfe]);
        log.append(&first).unwrap();
        log.append(&second).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded, vec![first, second]);
    }

    #[test]
    fn test_append_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/rec.jsonl");
        let log = FileExchangeLog::new(&path, false);
        log.append(&exchange("/a", 0, b"x")).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.jsonl");
        let log = FileExchangeLog::new(&path, false);
        log.append(&exchange("/a", 0, b"x")).unwrap();
        log.append(&exchange("/b", 0, b"y")).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap()
            .write_all(bytes)
            .unwrap();
    }

    #[test]
    fn test_corrupt_line_is_reported_with_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.jsonl");
        let log = FileExchangeLog::new(&path, false);
        log.append(&exchange("/a", 0, b"x")).unwrap();
        append_raw(&path, b"{\"fingerprint\": \"trunc\n");
        log.append(&exchange("/b", 0, b"y")).unwrap();

        match log.load() {
            Err(PersistenceError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corrupt error, got {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_last_record_is_ignored_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.jsonl");
        let log = FileExchangeLog::new(&path, false);
        let first = exchange("/a", 0, b"x");
        log.append(&first).unwrap();
        append_raw(&path, b"{\"fingerprint\": \"trunc");

        assert_eq!(log.load().unwrap(), vec![first]);
    }

    #[test]
    fn test_append_after_partial_write_starts_a_fresh_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.jsonl");
        let first = exchange("/a", 0, b"x");
        FileExchangeLog::new(&path, false).append(&first).unwrap();
        // What a write that failed half way leaves behind.
        append_raw(&path, b"{\"fingerprint\": \"trunc");

        let log = FileExchangeLog::new(&path, false);
        let acked = exchange("/b", 0, b"y");
        log.append(&acked).unwrap();

        assert_eq!(log.load().unwrap(), vec![first, acked]);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_unterminated_complete_record_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.jsonl");
        let first = exchange("/a", 0, b"x");
        fs::write(&path, serde_json::to_vec(&first).unwrap()).unwrap();

        let log = FileExchangeLog::new(&path, false);
        assert_eq!(log.load().unwrap(), vec![first.clone()]);

        let second = exchange("/a", 1, b"y");
        log.append(&second).unwrap();
        assert_eq!(log.load().unwrap(), vec![first, second]);
    }

    #[test]
    fn test_snapshot_replaces_contents_and_appends_continue() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileExchangeLog::new(dir.path().join("rec.jsonl"), true);
        log.append(&exchange("/a", 0, b"old")).unwrap();

        let kept = Arc::new(exchange("/b", 0, b"kept"));
        log.snapshot(&[Arc::clone(&kept)]).unwrap();
        assert_eq!(log.load().unwrap(), vec![(*kept).clone()]);

        let later = exchange("/b", 1, b"later");
        log.append(&later).unwrap();
        assert_eq!(log.load().unwrap(), vec![(*kept).clone(), later]);
        assert!(!log.temp_path().exists());
    }

    #[test]
    fn test_memory_log() {
        let log = MemoryExchangeLog::new();
        let ex = exchange("/a", 0, b"x");
        log.append(&ex).unwrap();
        assert_eq!(log.load().unwrap(), vec![ex]);
        log.snapshot(&[]).unwrap();
        assert!(log.load().unwrap().is_empty());
        assert_eq!(log.describe(), "memory");
    }
}
