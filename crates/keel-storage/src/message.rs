use bytes::Bytes;
use std::io::{self, Read, Write};

use crate::{Result, StorageError};

/// Fixed part of an on-disk record: id, enqueued_at and body length.
pub const RECORD_HEADER_LEN: usize = 8 + 8 + 4;

/// A message stored in a topic.
///
/// `body` is either shared with the publisher's buffer (fresh writes) or owns
/// bytes read back from a segment file during restore; readers treat both the
/// same.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    /// Unix microseconds, non-decreasing within a topic.
    pub enqueued_at: i64,
    pub body: Bytes,
}

impl Message {
    pub fn new(id: i64, enqueued_at: i64, body: Bytes) -> Self {
        Self {
            id,
            enqueued_at,
            body,
        }
    }

    pub fn encoded_len(&self) -> u64 {
        (RECORD_HEADER_LEN + self.body.len()) as u64
    }

    /// Writes `id:i64 | enqueued_at:i64 | body_len:i32 | body` little-endian.
    pub fn encode<W: Write>(&self, out: &mut W) -> Result<()> {
        let body_len = i32::try_from(self.body.len()).map_err(|_| {
            StorageError::Encoding(format!(
                "message {} body of {} bytes exceeds the record limit",
                self.id,
                self.body.len()
            ))
        })?;
        let mut header = [0u8; RECORD_HEADER_LEN];
        header[..8].copy_from_slice(&self.id.to_le_bytes());
        header[8..16].copy_from_slice(&self.enqueued_at.to_le_bytes());
        header[16..].copy_from_slice(&body_len.to_le_bytes());
        out.write_all(&header)?;
        out.write_all(&self.body)?;
        Ok(())
    }
}

/// Outcome of reading one record from a segment stream.
#[derive(Debug)]
pub(crate) enum RecordRead {
    Record(Message),
    /// Clean end of stream on a record boundary.
    End,
    /// The stream ended in the middle of a record.
    Torn,
}

pub(crate) fn read_record<R: Read>(reader: &mut R) -> Result<RecordRead> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    match read_full(reader, &mut header)? {
        0 => return Ok(RecordRead::End),
        n if n < RECORD_HEADER_LEN => return Ok(RecordRead::Torn),
        _ => {}
    }
    let id = i64::from_le_bytes(header[..8].try_into().expect("8 byte slice"));
    let enqueued_at = i64::from_le_bytes(header[8..16].try_into().expect("8 byte slice"));
    let body_len = i32::from_le_bytes(header[16..].try_into().expect("4 byte slice"));
    if body_len < 0 {
        return Err(StorageError::Restore(format!(
            "message {id} has a negative body length {body_len}"
        )));
    }
    // Sized by the bytes actually read, not the declared length.
    let mut body = Vec::new();
    reader.by_ref().take(body_len as u64).read_to_end(&mut body)?;
    if body.len() < body_len as usize {
        return Ok(RecordRead::Torn);
    }
    Ok(RecordRead::Record(Message::new(
        id,
        enqueued_at,
        Bytes::from(body),
    )))
}

// Like read_exact, but reports how much was read before end of stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn record_layout_is_fixed_header_then_body() {
        let message = Message::new(7, 1_000, Bytes::from_static(b"abc"));
        let mut out = Vec::new();
        message.encode(&mut out).expect("encode");
        assert_eq!(out.len() as u64, message.encoded_len());
        assert_eq!(&out[..8], &7i64.to_le_bytes());
        assert_eq!(&out[8..16], &1_000i64.to_le_bytes());
        assert_eq!(&out[16..20], &3i32.to_le_bytes());
        assert_eq!(&out[20..], b"abc");
    }

    #[test]
    fn short_streams_are_reported_as_torn() {
        let message = Message::new(1, 5, Bytes::from_static(b"hello"));
        let mut out = Vec::new();
        message.encode(&mut out).expect("encode");

        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_record(&mut empty), Ok(RecordRead::End)));

        let mut header_only = Cursor::new(out[..10].to_vec());
        assert!(matches!(read_record(&mut header_only), Ok(RecordRead::Torn)));

        let mut partial_body = Cursor::new(out[..22].to_vec());
        assert!(matches!(read_record(&mut partial_body), Ok(RecordRead::Torn)));

        let mut full = Cursor::new(out);
        match read_record(&mut full).expect("read") {
            RecordRead::Record(read) => assert_eq!(read, message),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_body_length_reads_as_torn() {
        let mut record = Vec::new();
        record.extend_from_slice(&3i64.to_le_bytes());
        record.extend_from_slice(&9i64.to_le_bytes());
        record.extend_from_slice(&i32::MAX.to_le_bytes());
        record.extend_from_slice(b"xyz");
        let mut stream = Cursor::new(record);
        assert!(matches!(read_record(&mut stream), Ok(RecordRead::Torn)));
    }
}
