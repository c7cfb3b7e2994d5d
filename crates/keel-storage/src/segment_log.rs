// Append-only message log split into size-bounded segment files.
//
// Each segment is named after the id of its first message so segments can be
// ordered and range-tested without opening them. Restore replays every segment
// in order and validates ids and timestamps before the log accepts new writes.
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use keel_common::FIRST_MESSAGE_ID;

use crate::message::{Message, RecordRead, read_record};
use crate::{Result, StorageError};

/// Durable, replayable message stream backing a topic.
pub trait MessageLog: Send {
    /// Replays everything on storage. The log accepts writes only after the
    /// returned iterator has been driven to completion without error.
    fn restore(&mut self) -> Result<Box<dyn Iterator<Item = Result<Message>> + '_>>;

    /// Id the next written message must carry. Meaningful after restore.
    fn next_id(&self) -> i64;

    fn write(&mut self, message: &Message) -> Result<()>;

    fn write_batch(&mut self, messages: &[Message]) -> Result<()> {
        for message in messages {
            self.write(message)?;
        }
        Ok(())
    }

    /// Forces everything written so far onto durable storage.
    fn flush(&mut self) -> Result<()>;

    /// Drops stored messages with ids up to and including `message_id`, at the
    /// granularity the implementation supports.
    fn free_to(&mut self, message_id: i64) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SegmentLogOptions {
    pub directory: PathBuf,
    pub name_prefix: String,
    /// A new segment is started before a write once the current one holds at
    /// least this many bytes.
    pub segment_size_bytes: u64,
}

impl SegmentLogOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            name_prefix: "segment".to_string(),
            segment_size_bytes: 100 * 1024 * 1024,
        }
    }

    fn segment_path(&self, start_id: i64) -> PathBuf {
        self.directory
            .join(format!("{}_{start_id:020}.log", self.name_prefix))
    }

    fn parse_start_id(&self, path: &Path) -> Option<i64> {
        let name = path.file_name()?.to_str()?;
        let digits = name
            .strip_prefix(self.name_prefix.as_str())?
            .strip_prefix('_')?
            .strip_suffix(".log")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

#[derive(Debug, Clone)]
struct Segment {
    start_id: i64,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    Fresh,
    Open,
    Closed,
}

pub struct SegmentedLog {
    options: SegmentLogOptions,
    segments: VecDeque<Segment>,
    writer: Option<BufWriter<File>>,
    // Bytes in the active segment, including buffered writes.
    current_len: u64,
    // Start id of the second segment; i64::MAX while there is only one.
    second_segment_start: i64,
    next_id: i64,
    state: LogState,
}

impl SegmentedLog {
    pub fn new(options: SegmentLogOptions) -> Self {
        Self {
            options,
            segments: VecDeque::new(),
            writer: None,
            current_len: 0,
            second_segment_start: i64::MAX,
            next_id: FIRST_MESSAGE_ID,
            state: LogState::Fresh,
        }
    }

    pub fn options(&self) -> &SegmentLogOptions {
        &self.options
    }

    /// Start ids of the segments currently on disk, oldest first.
    pub fn segment_start_ids(&self) -> Vec<i64> {
        self.segments.iter().map(|segment| segment.start_id).collect()
    }

    fn discover(&self) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.options.directory)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(start_id) = self.options.parse_start_id(&path) {
                segments.push(Segment { start_id, path });
            }
        }
        segments.sort_by_key(|segment| segment.start_id);
        Ok(segments)
    }

    fn open_for_append(&mut self, segments: Vec<Segment>, next_id: i64) -> Result<()> {
        let Some(active) = segments.last() else {
            return Err(StorageError::Restore("no segment to append to".into()));
        };
        let file = OpenOptions::new().append(true).open(&active.path)?;
        self.current_len = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));
        self.segments = segments.into();
        self.refresh_second_segment_start();
        self.next_id = next_id;
        self.state = LogState::Open;
        tracing::debug!(
            directory = %self.options.directory.display(),
            segments = self.segments.len(),
            next_id,
            "segment log opened"
        );
        Ok(())
    }

    fn refresh_second_segment_start(&mut self) {
        self.second_segment_start = self
            .segments
            .get(1)
            .map(|segment| segment.start_id)
            .unwrap_or(i64::MAX);
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        match self.state {
            LogState::Fresh => Err(StorageError::NotRestored),
            LogState::Closed => Err(StorageError::Closed),
            LogState::Open => self.writer.as_mut().ok_or(StorageError::Closed),
        }
    }

    fn rotate_if_needed(&mut self, start_id: i64) -> Result<()> {
        if self.current_len < self.options.segment_size_bytes {
            return Ok(());
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        let path = self.options.segment_path(start_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        self.current_len = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));
        self.segments.push_back(Segment { start_id, path });
        self.refresh_second_segment_start();
        tracing::debug!(start_id, "segment rotated");
        Ok(())
    }
}

impl MessageLog for SegmentedLog {
    fn restore(&mut self) -> Result<Box<dyn Iterator<Item = Result<Message>> + '_>> {
        if self.state == LogState::Closed {
            return Err(StorageError::Closed);
        }
        fs::create_dir_all(&self.options.directory)?;
        self.writer = None;
        self.state = LogState::Fresh;
        let segments = self.discover()?;
        if segments.is_empty() {
            let path = self.options.segment_path(FIRST_MESSAGE_ID);
            File::create(&path)?;
            self.open_for_append(
                vec![Segment {
                    start_id: FIRST_MESSAGE_ID,
                    path,
                }],
                FIRST_MESSAGE_ID,
            )?;
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(Replay {
            log: self,
            segments,
            index: 0,
            reader: None,
            valid_len: 0,
            first_in_segment: true,
            last: None,
            done: false,
        }))
    }

    fn next_id(&self) -> i64 {
        self.next_id
    }

    fn write(&mut self, message: &Message) -> Result<()> {
        self.writer()?;
        if message.id != self.next_id {
            return Err(StorageError::Sequence {
                expected: self.next_id,
                actual: message.id,
            });
        }
        self.rotate_if_needed(message.id)?;
        let writer = self.writer()?;
        message.encode(writer)?;
        self.current_len += message.encoded_len();
        self.next_id = message.id + 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn free_to(&mut self, message_id: i64) -> Result<()> {
        self.writer()?;
        let cutoff = message_id.saturating_add(1);
        if self.second_segment_start > cutoff {
            return Ok(());
        }
        // A segment is removable once the next one starts at or below the cutoff.
        while self.segments.len() > 1 && self.segments[1].start_id <= cutoff {
            let path = self.segments[0].path.clone();
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            tracing::debug!(path = %path.display(), "segment deleted");
            self.segments.pop_front();
        }
        self.refresh_second_segment_start();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == LogState::Open {
            self.flush()?;
        }
        self.writer = None;
        self.state = LogState::Closed;
        Ok(())
    }
}

// Lazy replay over the discovered segments. Finishing the replay positions the
// log for appending; an error or an abandoned replay leaves it unrestored.
struct Replay<'a> {
    log: &'a mut SegmentedLog,
    segments: Vec<Segment>,
    index: usize,
    reader: Option<BufReader<File>>,
    valid_len: u64,
    first_in_segment: bool,
    // (id, enqueued_at) of the last replayed message.
    last: Option<(i64, i64)>,
    done: bool,
}

impl Replay<'_> {
    fn advance(&mut self) -> Result<Option<Message>> {
        loop {
            let Some(segment) = self.segments.get(self.index).cloned() else {
                self.finish()?;
                return Ok(None);
            };
            if self.reader.is_none() {
                self.reader = Some(BufReader::new(File::open(&segment.path)?));
                self.valid_len = 0;
                self.first_in_segment = true;
            }
            let Some(reader) = self.reader.as_mut() else {
                continue;
            };
            match read_record(reader)? {
                RecordRead::Record(message) => {
                    self.validate(&segment, &message)?;
                    self.valid_len += message.encoded_len();
                    self.first_in_segment = false;
                    self.last = Some((message.id, message.enqueued_at));
                    return Ok(Some(message));
                }
                RecordRead::End => self.end_of_segment(&segment)?,
                RecordRead::Torn => {
                    if self.index + 1 != self.segments.len() {
                        return Err(StorageError::Restore(format!(
                            "segment {} ends with a partial record",
                            segment.path.display()
                        )));
                    }
                    // Never flushed completely, so never acknowledged.
                    self.reader = None;
                    let file = OpenOptions::new().write(true).open(&segment.path)?;
                    file.set_len(self.valid_len)?;
                    file.sync_all()?;
                    tracing::warn!(
                        segment = %segment.path.display(),
                        valid_len = self.valid_len,
                        "truncated partial record at the end of the log"
                    );
                    self.end_of_segment(&segment)?;
                }
            }
        }
    }

    fn validate(&self, segment: &Segment, message: &Message) -> Result<()> {
        if self.first_in_segment && message.id != segment.start_id {
            return Err(StorageError::Restore(format!(
                "segment {} declares start id {} but begins with message {}",
                segment.path.display(),
                segment.start_id,
                message.id
            )));
        }
        if let Some((last_id, last_enqueued_at)) = self.last {
            if message.id != last_id + 1 {
                return Err(StorageError::Restore(format!(
                    "message {} follows message {last_id}",
                    message.id
                )));
            }
            if message.enqueued_at < last_enqueued_at {
                return Err(StorageError::Restore(format!(
                    "message {} is timestamped before message {last_id}",
                    message.id
                )));
            }
        }
        Ok(())
    }

    fn end_of_segment(&mut self, segment: &Segment) -> Result<()> {
        if self.first_in_segment {
            let is_first = self.index == 0;
            let is_last = self.index + 1 == self.segments.len();
            let accepted = match self.last {
                // An empty sole segment is the origin of an empty topic.
                None => is_first && is_last && segment.start_id >= FIRST_MESSAGE_ID,
                // Crash right after rotation.
                Some((last_id, _)) => is_last && segment.start_id == last_id + 1,
            };
            if !accepted {
                return Err(StorageError::Restore(format!(
                    "unexpected empty segment {}",
                    segment.path.display()
                )));
            }
        }
        self.reader = None;
        self.index += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let next_id = match (self.last, self.segments.last()) {
            (Some((last_id, _)), _) => last_id + 1,
            (None, Some(segment)) => segment.start_id,
            (None, None) => FIRST_MESSAGE_ID,
        };
        let segments = std::mem::take(&mut self.segments);
        self.log.open_for_append(segments, next_id)
    }
}

impl Iterator for Replay<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
