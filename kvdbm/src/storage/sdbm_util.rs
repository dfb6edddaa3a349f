use crate::{DbmErrorKind, FilePerms, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const TAG_SET: u8 = 1;
const TAG_REMOVE: u8 = 2;

/// util to create "{path}{suffix}" as a PathBuf,
/// the suffix is appended to the file name rather than
/// replacing its extension
pub(super) fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// ("{path}.pag", "{path}.dir")
pub(super) fn file_names(path: &Path) -> (PathBuf, PathBuf) {
    (suffixed(path, ".pag"), suffixed(path, ".dir"))
}

/// OpenOptions that give newly created files the requested permissions
pub(super) fn create_options(perms: FilePerms) -> OpenOptions {
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(perms.posix_mode());
    }
    #[cfg(not(unix))]
    let _ = perms;
    options
}

/// One entry of the page log
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Record {
    Set { key: Vec<u8>, val: Vec<u8> },

    Remove { key: Vec<u8> },
}

/// Result of decoding the next record of a log
#[derive(Debug)]
pub(super) enum Decoded {
    /// a complete record and its encoded length
    Record(Record, u64),
    /// clean end of the log
    End,
    /// the log ends in the middle of a record
    Torn,
}

impl Record {
    /// encode as `tag | key len | [val len] | key | [val]`,
    /// returns the number of bytes written
    pub(super) fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<u64> {
        match self {
            Record::Set { key, val } => {
                let (key_len, val_len) = (frame_len(key.len())?, frame_len(val.len())?);
                writer.write_u8(TAG_SET)?;
                writer.write_u32::<BigEndian>(key_len)?;
                writer.write_u32::<BigEndian>(val_len)?;
                writer.write_all(key)?;
                writer.write_all(val)?;
                Ok(9 + key.len() as u64 + val.len() as u64)
            }
            Record::Remove { key } => {
                let key_len = frame_len(key.len())?;
                writer.write_u8(TAG_REMOVE)?;
                writer.write_u32::<BigEndian>(key_len)?;
                writer.write_all(key)?;
                Ok(5 + key.len() as u64)
            }
        }
    }

    pub(super) fn read_from<R: Read>(reader: &mut R) -> Result<Decoded> {
        let tag = match reader.read_u8() {
            Ok(tag) => tag,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(Decoded::End),
            Err(err) => return Err(err.into()),
        };

        match tag {
            TAG_SET => {
                let (key_len, val_len) = match (read_len(reader)?, read_len(reader)?) {
                    (Some(key_len), Some(val_len)) => (key_len, val_len),
                    _ => return Ok(Decoded::Torn),
                };
                let key = match read_exact_vec(reader, key_len)? {
                    Some(key) => key,
                    None => return Ok(Decoded::Torn),
                };
                let val = match read_exact_vec(reader, val_len)? {
                    Some(val) => val,
                    None => return Ok(Decoded::Torn),
                };
                let len = 9 + key_len + val_len;
                Ok(Decoded::Record(Record::Set { key, val }, len))
            }
            TAG_REMOVE => {
                let key_len = match read_len(reader)? {
                    Some(key_len) => key_len,
                    None => return Ok(Decoded::Torn),
                };
                let key = match read_exact_vec(reader, key_len)? {
                    Some(key) => key,
                    None => return Ok(Decoded::Torn),
                };
                Ok(Decoded::Record(Record::Remove { key }, 5 + key_len))
            }
            _ => Err(DbmErrorKind::CorruptLog.into()),
        }
    }
}

// lengths are framed as u32, larger datums are refused before
// any byte of the record is written
fn frame_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("datum of {} bytes exceeds the record size limit", len),
        )
    })
}

fn read_len<R: Read>(reader: &mut R) -> Result<Option<u64>> {
    match reader.read_u32::<BigEndian>() {
        Ok(len) => Ok(Some(u64::from(len))),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

// a corrupt length only reads what is left in the file
// instead of allocating it up front
fn read_exact_vec<R: Read>(reader: &mut R, len: u64) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![];
    reader.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 == len {
        Ok(Some(buf))
    } else {
        Ok(None)
    }
}

/// Outcome of replaying (part of) a page log
#[derive(Debug, Default)]
pub(super) struct Replay {
    /// bytes taken up by overwritten or removed records
    pub(super) uncompacted: u64,
    /// end of the last complete record
    pub(super) end: u64,
    /// whether an incomplete record follows `end`
    pub(super) torn: bool,
}

/// Scan the log from `start`, update the in-memory index
/// based on the records found
pub(super) fn replay_log(
    reader: &mut BufReader<File>,
    start: u64,
    index: &mut BTreeMap<Vec<u8>, RecordPos>,
) -> Result<Replay> {
    let mut replay = Replay {
        end: start,
        ..Replay::default()
    };

    let mut pos = reader.seek(SeekFrom::Start(start))?;
    loop {
        let (record, len) = match Record::read_from(reader)? {
            Decoded::Record(record, len) => (record, len),
            Decoded::End => break,
            Decoded::Torn => {
                replay.torn = true;
                break;
            }
        };

        match record {
            Record::Set { key, .. } => {
                if let Some(old) = index.insert(key, (pos, len).into()) {
                    replay.uncompacted += old.len;
                }
            }
            Record::Remove { key } => {
                // the remove record itself is dropped by the next compaction
                replay.uncompacted += len;
                if let Some(old) = index.remove(&key) {
                    replay.uncompacted += old.len;
                }
            }
        }
        pos += len;
        replay.end = pos;
    }

    Ok(replay)
}

/// On-disk form of the index, kept in the ".dir" file
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct DirSnapshot {
    /// length of the log this snapshot covers
    pub(super) log_len: u64,
    pub(super) uncompacted: u64,
    pub(super) entries: Vec<(Vec<u8>, u64, u64)>,
}

impl DirSnapshot {
    pub(super) fn capture(
        index: &BTreeMap<Vec<u8>, RecordPos>,
        log_len: u64,
        uncompacted: u64,
    ) -> Self {
        let entries = index
            .iter()
            .map(|(key, rec)| (key.clone(), rec.pos, rec.len))
            .collect();
        Self {
            log_len,
            uncompacted,
            entries,
        }
    }

    /// rebuild the index, `None` if the snapshot does not fit
    /// a log of `file_len` bytes
    pub(super) fn restore(self, file_len: u64) -> Option<BTreeMap<Vec<u8>, RecordPos>> {
        if self.log_len > file_len {
            return None;
        }
        let mut index = BTreeMap::new();
        for (key, pos, len) in self.entries {
            match pos.checked_add(len) {
                Some(end) if end <= self.log_len => {}
                _ => return None,
            }
            index.insert(key, RecordPos { pos, len });
        }
        Some(index)
    }
}

/// read the ".dir" snapshot, a missing or unreadable snapshot
/// only means the whole log gets replayed
pub(super) fn load_snapshot(dir_path: &Path) -> Option<DirSnapshot> {
    let file = match File::open(dir_path) {
        Ok(file) => file,
        Err(_) => return None,
    };
    match serde_json::from_reader(BufReader::new(file)) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!("Ignoring unreadable index {}: {}", dir_path.display(), err);
            None
        }
    }
}

pub(super) fn write_snapshot(dir_path: &Path, perms: FilePerms, snapshot: &DirSnapshot) -> Result<()> {
    let file = create_options(perms)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dir_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, snapshot)?;
    writer.flush()?;
    Ok(())
}

// Wrapper around BufWriter that is aware of its current offset
#[derive(Debug)]
pub(super) struct PositionedBufWriter<W: Write + Seek> {
    writer: BufWriter<W>,
    pub(super) pos: u64,
}

impl<W: Write + Seek> PositionedBufWriter<W> {
    pub(super) fn new(mut inner: W) -> io::Result<Self> {
        let pos = inner.seek(SeekFrom::Current(0))?;
        Ok(Self {
            writer: BufWriter::new(inner),
            pos,
        })
    }
}

impl<W: Write + Seek> Write for PositionedBufWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

// Describes a record in the page log
// at offset pos with length len
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) struct RecordPos {
    pub(super) pos: u64,
    pub(super) len: u64,
}

impl From<(u64, u64)> for RecordPos {
    fn from((pos, len): (u64, u64)) -> Self {
        Self { pos, len }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn suffix_keeps_extension() {
        let (pag, dir) = file_names(Path::new("/tmp/store.db"));
        assert_eq!(pag, PathBuf::from("/tmp/store.db.pag"));
        assert_eq!(dir, PathBuf::from("/tmp/store.db.dir"));
    }

    #[test]
    fn record_lengths_match_encoding() -> Result<()> {
        let mut buf = vec![];
        let set = Record::Set {
            key: b"key".to_vec(),
            val: b"value".to_vec(),
        };
        let len = set.write_to(&mut buf)?;
        assert_eq!(len, buf.len() as u64);

        let remove = Record::Remove { key: b"key".to_vec() };
        let len2 = remove.write_to(&mut buf)?;
        assert_eq!(len + len2, buf.len() as u64);

        let mut reader = Cursor::new(buf);
        match Record::read_from(&mut reader)? {
            Decoded::Record(record, l) => {
                assert_eq!(record, set);
                assert_eq!(l, len);
            }
            other => panic!("unexpected {:?}", other),
        }
        match Record::read_from(&mut reader)? {
            Decoded::Record(record, _) => assert_eq!(record, remove),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(Record::read_from(&mut reader)?, Decoded::End));
        Ok(())
    }

    #[test]
    fn truncated_record_is_torn() -> Result<()> {
        let mut buf = vec![];
        Record::Set {
            key: b"key".to_vec(),
            val: b"a longer value".to_vec(),
        }
        .write_to(&mut buf)?;
        buf.truncate(buf.len() - 3);

        let mut reader = Cursor::new(buf);
        assert!(matches!(Record::read_from(&mut reader)?, Decoded::Torn));
        Ok(())
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        let mut reader = Cursor::new(vec![7u8, 0, 0, 0, 0]);
        let err = Record::read_from(&mut reader).unwrap_err();
        assert_eq!(err.kind(), DbmErrorKind::CorruptLog);
    }

    #[test]
    fn snapshot_past_log_end_is_rejected() {
        let mut index = BTreeMap::new();
        index.insert(b"k".to_vec(), RecordPos::from((0, 20)));
        let snapshot = DirSnapshot::capture(&index, 20, 0);
        assert!(DirSnapshot::capture(&index, 20, 0).restore(20).is_some());
        assert!(snapshot.restore(10).is_none());
    }

    #[test]
    fn snapshot_with_overflowing_entry_is_rejected() {
        let snapshot: DirSnapshot = serde_json::from_str(
            r#"{"log_len":0,"uncompacted":0,"entries":[[[107],18446744073709551615,2]]}"#,
        )
        .expect("valid snapshot json");
        assert!(snapshot.restore(0).is_none());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_length_is_refused() {
        assert_eq!(frame_len(u32::MAX as usize).ok(), Some(u32::MAX));
        let err = frame_len(u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
