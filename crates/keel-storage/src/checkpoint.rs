// Durable map of subscription id -> last completed message id.
//
// Updates are appended as fixed 24-byte records and replayed last-wins. The
// file is rewritten from the in-memory map once it grows past a threshold.
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use keel_common::ids::SubscriptionId;

use crate::{Result, StorageError};

const RECORD_LEN: usize = 16 + 8;

pub trait CheckpointStore: Send {
    /// Loads the latest checkpoint of every subscription written so far.
    fn restore(&mut self) -> Result<HashMap<SubscriptionId, i64>>;

    fn write(&mut self, id: SubscriptionId, completed_message_id: i64) -> Result<()>;

    /// Forgets a deleted subscription.
    fn remove(&mut self, id: SubscriptionId) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    pub directory: PathBuf,
    pub name_prefix: String,
    pub compaction_threshold_bytes: u64,
}

impl CheckpointOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            name_prefix: "checkpoints".to_string(),
            compaction_threshold_bytes: 10 * 1024 * 1024,
        }
    }

    fn path(&self) -> PathBuf {
        self.directory.join(format!("{}.bin", self.name_prefix))
    }

    fn compaction_path(&self) -> PathBuf {
        self.directory.join(format!("{}_new.bin", self.name_prefix))
    }
}

pub struct FileCheckpointStore {
    options: CheckpointOptions,
    writer: Option<BufWriter<File>>,
    file_len: u64,
    latest: HashMap<SubscriptionId, i64>,
    restored: bool,
    closed: bool,
}

impl FileCheckpointStore {
    pub fn new(options: CheckpointOptions) -> Self {
        Self {
            options,
            writer: None,
            file_len: 0,
            latest: HashMap::new(),
            restored: false,
            closed: false,
        }
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if !self.restored {
            return Err(StorageError::NotRestored);
        }
        // Reopened lazily after a compaction that could not reopen the file.
        if self.writer.is_none() {
            self.open_for_append()?;
        }
        self.writer.as_mut().ok_or(StorageError::NotRestored)
    }

    // The old file and its writer stay in place until the replacement is
    // renamed over it, so a failed compaction leaves the store writable.
    fn compact(&mut self) -> Result<()> {
        let path = self.options.path();
        let compaction_path = self.options.compaction_path();
        let replaced = self
            .write_compacted(&compaction_path)
            .and_then(|()| fs::rename(&compaction_path, &path).map_err(StorageError::from));
        if let Err(err) = replaced {
            if let Err(cleanup) = fs::remove_file(&compaction_path)
                && cleanup.kind() != io::ErrorKind::NotFound
            {
                tracing::debug!(
                    path = %compaction_path.display(),
                    error = %cleanup,
                    "leftover compaction file not removed"
                );
            }
            return Err(err);
        }
        self.writer = None;
        self.open_for_append()?;
        tracing::debug!(
            path = %path.display(),
            subscriptions = self.latest.len(),
            "checkpoint file compacted"
        );
        Ok(())
    }

    fn write_compacted(&self, compaction_path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(compaction_path)?);
        for (id, completed) in &self.latest {
            out.write_all(&encode(*id, *completed))?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }

    fn open_for_append(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.options.path())?;
        self.file_len = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn restore(&mut self) -> Result<HashMap<SubscriptionId, i64>> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        fs::create_dir_all(&self.options.directory)?;
        let path = self.options.path();
        let compaction_path = self.options.compaction_path();
        // A finished compaction whose rename never happened.
        if !path.exists() && compaction_path.exists() {
            fs::rename(&compaction_path, &path)?;
        }
        self.latest.clear();
        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut record = [0u8; RECORD_LEN];
            let mut valid_len = 0u64;
            loop {
                match reader.read_exact(&mut record) {
                    Ok(()) => {
                        let (id, completed) = decode(&record);
                        self.latest.insert(id, completed);
                        valid_len += RECORD_LEN as u64;
                    }
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(err) => return Err(err.into()),
                }
            }
            drop(reader);
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() != valid_len {
                // Keep later appends aligned on record boundaries.
                file.set_len(valid_len)?;
                file.sync_all()?;
                tracing::warn!(path = %path.display(), "dropped partial checkpoint record");
            }
        }
        self.open_for_append()?;
        self.restored = true;
        Ok(self.latest.clone())
    }

    fn write(&mut self, id: SubscriptionId, completed_message_id: i64) -> Result<()> {
        let writer = self.writer()?;
        writer.write_all(&encode(id, completed_message_id))?;
        self.file_len += RECORD_LEN as u64;
        self.latest.insert(id, completed_message_id);
        Ok(())
    }

    fn remove(&mut self, id: SubscriptionId) -> Result<()> {
        self.writer()?;
        self.latest.remove(&id);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        if self.file_len >= self.options.compaction_threshold_bytes {
            self.compact()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.writer.is_some() && !self.closed {
            self.flush()?;
        }
        self.writer = None;
        self.closed = true;
        Ok(())
    }
}

fn encode(id: SubscriptionId, completed: i64) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[..16].copy_from_slice(&id.to_bytes());
    record[16..].copy_from_slice(&completed.to_le_bytes());
    record
}

fn decode(record: &[u8; RECORD_LEN]) -> (SubscriptionId, i64) {
    let mut id = [0u8; 16];
    id.copy_from_slice(&record[..16]);
    let mut completed = [0u8; 8];
    completed.copy_from_slice(&record[16..]);
    (
        SubscriptionId::from_bytes(id),
        i64::from_le_bytes(completed),
    )
}
