//! Flat record framing.
//!
//! A flat record stream is a sequence of frames, each made of a marker byte,
//! an LEB128 length and the payload. Key/value pairs are stored as two
//! consecutive frames.

use dbmbind_core::{Status, StatusCode};
use tracing::debug;

use crate::engine::{Engine, EngineResult};
use crate::file::PositionalFile;

/// Marker byte that opens every frame.
pub const RECORD_MARKER: u8 = 0xFF;

/// Longest LEB128 encoding of a `u64`.
const MAX_VARINT_LEN: usize = 10;

/// Append one frame carrying `data` to `buf`.
pub fn write_record(buf: &mut Vec<u8>, data: &[u8]) {
    buf.push(RECORD_MARKER);
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Append a key frame followed by a value frame.
pub fn write_pair(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    write_record(buf, key);
    write_record(buf, value);
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (idx, byte) in data.iter().take(MAX_VARINT_LEN).enumerate() {
        let shift = u32::try_from(idx).ok()?.checked_mul(7)?;
        let part = u64::from(byte & 0x7F).checked_shl(shift)?;
        value |= part;
        if byte & 0x80 == 0 {
            return Some((value, idx.checked_add(1)?));
        }
    }
    None
}

/// Sequential reader over a flat record stream.
///
/// Yields one payload per frame. A malformed or truncated frame yields a
/// `BROKEN_DATA_ERROR` once and then ends the stream.
#[derive(Debug)]
pub struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> RecordReader<'a> {
    /// Read frames from `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
        }
    }

    /// Offset of the next unread frame.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn broken(&mut self, what: &str) -> Option<Result<&'a [u8], Status>> {
        self.failed = true;
        Some(Err(Status::with_message(
            StatusCode::BrokenDataError,
            format!("{what} at offset {}", self.pos),
        )))
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Result<&'a [u8], Status>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let rest = self.data.get(self.pos..)?;
        let (&marker, rest) = rest.split_first()?;
        if marker != RECORD_MARKER {
            return self.broken("invalid record marker");
        }
        let Some((len, len_size)) = read_varint(rest) else {
            return self.broken("invalid record length");
        };
        let Ok(len) = usize::try_from(len) else {
            return self.broken("oversized record");
        };
        let Some(payload) = len_size
            .checked_add(len)
            .and_then(|end| rest.get(len_size..end))
        else {
            return self.broken("truncated record");
        };
        self.pos = self
            .pos
            .saturating_add(1)
            .saturating_add(len_size)
            .saturating_add(len);
        Some(Ok(payload))
    }
}

/// Decode a stream of key/value frames.
///
/// # Errors
///
/// Returns `BROKEN_DATA_ERROR` on a malformed frame or a dangling key.
pub fn read_pairs(data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Status> {
    let mut reader = RecordReader::new(data);
    let mut pairs = Vec::new();
    while let Some(key) = reader.next() {
        let key = key?;
        let value = match reader.next() {
            Some(value) => value?,
            None => {
                return Err(Status::with_message(
                    StatusCode::BrokenDataError,
                    "key without a value",
                ));
            },
        };
        pairs.push((key.to_vec(), value.to_vec()));
    }
    Ok(pairs)
}

/// Decode as many intact key/value pairs as possible, stopping at the first
/// malformed frame.
#[must_use]
pub fn salvage_pairs(data: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut reader = RecordReader::new(data);
    let mut pairs = Vec::new();
    while let (Some(Ok(key)), Some(Ok(value))) = (reader.next(), reader.next()) {
        pairs.push((key.to_vec(), value.to_vec()));
    }
    pairs
}

/// Append every record of `engine` to `file` as a flat record stream.
///
/// # Errors
///
/// Failures from iterating the engine or writing the file.
pub fn export_to_flat_records(engine: &dyn Engine, file: &PositionalFile) -> EngineResult<()> {
    let mut buf = Vec::new();
    let mut count: u64 = 0;
    engine.for_each(&mut |key, value| {
        write_pair(&mut buf, key, value);
        count = count.saturating_add(1);
        true
    })?;
    file.append(&buf)?;
    debug!(path = file.path(), count, "exported flat records");
    Ok(())
}

/// Store every record of the flat record stream in `file` into `engine`,
/// overwriting existing keys.
///
/// # Errors
///
/// `BROKEN_DATA_ERROR` when the stream is malformed, or failures from the
/// engine.
pub fn import_from_flat_records(engine: &dyn Engine, file: &PositionalFile) -> EngineResult<()> {
    let data = file.read_all()?;
    let pairs = read_pairs(&data)?;
    for (key, value) in &pairs {
        engine.set(key, value, true)?;
    }
    debug!(path = file.path(), count = pairs.len(), "imported flat records");
    Ok(())
}

/// Append every key of `engine` to `file`, one per line.
///
/// # Errors
///
/// Failures from iterating the engine or writing the file.
pub fn export_keys_as_lines(engine: &dyn Engine, file: &PositionalFile) -> EngineResult<()> {
    let mut buf = Vec::new();
    engine.for_each(&mut |key, _| {
        buf.extend_from_slice(key);
        buf.push(b'\n');
        true
    })?;
    file.append(&buf).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OpenOptions;
    use crate::tree::TreeEngine;

    #[test]
    fn test_pairs_decode_in_order() {
        let mut buf = Vec::new();
        write_pair(&mut buf, b"one", b"first");
        write_pair(&mut buf, b"", b"");
        write_pair(&mut buf, &[0u8; 300], b"long");
        let pairs = read_pairs(&buf).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], (b"one".to_vec(), b"first".to_vec()));
        assert_eq!(pairs[1], (Vec::new(), Vec::new()));
        assert_eq!(pairs[2].0.len(), 300);
    }

    #[test]
    fn test_varint_multi_byte() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xAC, 0x02]);
        assert_eq!(read_varint(&buf), Some((300, 2)));
    }

    #[test]
    fn test_truncated_stream_is_broken() {
        let mut buf = Vec::new();
        write_pair(&mut buf, b"key", b"value");
        buf.truncate(buf.len() - 2);
        let err = read_pairs(&buf).unwrap_err();
        assert_eq!(err, StatusCode::BrokenDataError);
    }

    #[test]
    fn test_dangling_key_is_broken() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"key");
        assert_eq!(read_pairs(&buf).unwrap_err(), StatusCode::BrokenDataError);
    }

    #[test]
    fn test_salvage_stops_at_damage() {
        let mut buf = Vec::new();
        write_pair(&mut buf, b"a", b"1");
        write_pair(&mut buf, b"b", b"2");
        let intact = buf.len();
        write_pair(&mut buf, b"c", b"3");
        buf[intact] = 0x00;
        let pairs = salvage_pairs(&buf);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1], (b"b".to_vec(), b"2".to_vec()));
    }

    #[test]
    fn test_export_then_import_between_engines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.flat");
        let file =
            PositionalFile::open(path.to_str().unwrap(), true, &OpenOptions::default()).unwrap();

        let src = TreeEngine::in_memory();
        src.set(b"apple", b"red", true).unwrap();
        src.set(b"banana", b"yellow", true).unwrap();
        export_to_flat_records(&src, &file).unwrap();

        let dest = TreeEngine::in_memory();
        dest.set(b"apple", b"green", true).unwrap();
        import_from_flat_records(&dest, &file).unwrap();
        assert_eq!(dest.count().unwrap(), 2);
        assert_eq!(dest.get(b"apple").unwrap(), b"red");
    }

    #[test]
    fn test_export_keys_as_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        let file =
            PositionalFile::open(path.to_str().unwrap(), true, &OpenOptions::default()).unwrap();
        let engine = TreeEngine::in_memory();
        engine.set(b"b", b"2", true).unwrap();
        engine.set(b"a", b"1", true).unwrap();
        export_keys_as_lines(&engine, &file).unwrap();
        assert_eq!(file.read_all().unwrap(), b"a\nb\n");
    }
}
