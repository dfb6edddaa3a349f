use super::sdbm_util::*;
use super::{require_writable, Cursor, DbmStore, DbmType};
use crate::{Datum, DbmErrorKind, FilePerms, OpenMode, Result};
use std::collections::BTreeMap;
use std::fs::{self, File, TryLockError};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

// try to compact the page log once 1MB of it is stale
const COMPACTION_THRESHOLD: u64 = 1024 * 1024;

/// The native backend: a log-structured store kept in a pair of files.
///
/// `{path}.pag` is an append-only log of set/remove records and
/// `{path}.dir` holds a snapshot of the in-memory index, so reopening
/// only replays the part of the log written after the snapshot.
/// Keys iterate in byte order.
///
/// A handle is not internally synchronized; share it across threads
/// only behind a lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdbmType;

impl DbmType for SdbmType {
    fn name(&self) -> &'static str {
        "SDBM"
    }

    fn open(&self, path: &Path, mode: OpenMode, perms: FilePerms) -> Result<Box<dyn DbmStore>> {
        Ok(Box::new(SdbmStore::open(path, mode, perms)?))
    }

    fn usednames(&self, path: &Path) -> (PathBuf, Option<PathBuf>) {
        let (pag_path, dir_path) = file_names(path);
        (pag_path, Some(dir_path))
    }
}

#[derive(Debug)]
struct SdbmStore {
    pag_path: PathBuf,
    dir_path: PathBuf,
    mode: OpenMode,
    perms: FilePerms,
    reader: BufReader<File>,
    writer: Option<PositionedBufWriter<File>>,
    index: BTreeMap<Vec<u8>, RecordPos>,
    log_len: u64,
    uncompacted: u64,
    dirty: bool,
    cursor: Cursor,
}

impl SdbmStore {
    fn open(path: &Path, mode: OpenMode, perms: FilePerms) -> Result<Self> {
        let (pag_path, dir_path) = file_names(path);

        // the lock is taken before anything is truncated
        let writer_file = if mode.is_writable() {
            let file = create_options(perms)
                .read(true)
                .write(true)
                .create(mode.creates())
                .truncate(false)
                .open(&pag_path)?;
            lock_log(&file, &pag_path, true)?;
            if mode == OpenMode::RwTrunc {
                file.set_len(0)?;
                remove_if_exists(&dir_path)?;
            }
            Some(file)
        } else {
            None
        };

        let reader_file = File::open(&pag_path)?;
        if writer_file.is_none() {
            lock_log(&reader_file, &pag_path, false)?;
        }
        let mut reader = BufReader::new(reader_file);
        let file_len = reader.seek(SeekFrom::End(0))?;

        // start from the snapshot if it matches the log, otherwise
        // rebuild the whole index from the log
        let mut index = BTreeMap::new();
        let mut uncompacted = 0;
        let mut replay_from = 0;
        if let Some(snapshot) = load_snapshot(&dir_path) {
            let (log_len, snapshot_uncompacted) = (snapshot.log_len, snapshot.uncompacted);
            match snapshot.restore(file_len) {
                Some(restored) => {
                    index = restored;
                    uncompacted = snapshot_uncompacted;
                    replay_from = log_len;
                }
                None => warn!("Index {} does not match its log", dir_path.display()),
            }
        }

        let replay = replay_log(&mut reader, replay_from, &mut index)?;
        uncompacted += replay.uncompacted;
        let log_len = replay.end;
        if replay.torn {
            warn!(
                "Discarding incomplete record at offset {} of {}",
                log_len,
                pag_path.display()
            );
        }

        let writer = match writer_file {
            Some(mut file) => {
                if log_len < file_len {
                    file.set_len(log_len)?;
                }
                file.seek(SeekFrom::Start(log_len))?;
                Some(PositionedBufWriter::new(file)?)
            }
            None => None,
        };

        debug!(
            "Opened {} with {} keys, {} of {} bytes stale",
            pag_path.display(),
            index.len(),
            uncompacted,
            log_len
        );

        Ok(Self {
            pag_path,
            dir_path,
            mode,
            perms,
            reader,
            writer,
            index,
            log_len,
            uncompacted,
            dirty: replay.end != replay_from,
            cursor: Cursor::default(),
        })
    }

    fn writer(&mut self) -> Result<&mut PositionedBufWriter<File>> {
        require_writable(self.mode)?;
        self.writer
            .as_mut()
            .ok_or_else(|| DbmErrorKind::ReadOnly.into())
    }

    fn append(&mut self, record: &Record) -> Result<RecordPos> {
        let writer = self.writer()?;
        // this is the position of the current record
        let pos = writer.pos;
        let len = record.write_to(writer)?;
        writer.flush()?;

        self.log_len = pos + len;
        self.dirty = true;
        Ok((pos, len).into())
    }

    // the value of the set record for `key` at `rec`
    fn read_value(&mut self, key: &[u8], rec: RecordPos) -> Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(rec.pos))?;
        match Record::read_from(&mut self.reader)? {
            Decoded::Record(Record::Set { key: found, val }, len)
                if len == rec.len && found == key =>
            {
                Ok(val)
            }
            _ => {
                error!(
                    "Record at offset {} of {} does not hold the indexed key",
                    rec.pos,
                    self.pag_path.display()
                );
                Err(DbmErrorKind::CorruptLog.into())
            }
        }
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.uncompacted > COMPACTION_THRESHOLD {
            self.compact()?;
        }
        Ok(())
    }

    // the procedure of compaction is:
    // 1. copy live records to "{path}.pag.compact"
    // 2. drop the snapshot, it describes the old log
    // 3. move the compacted log over the old one
    // 4. point the index at the new log and snapshot it
    fn compact(&mut self) -> Result<()> {
        let compact_path = suffixed(&self.pag_path, ".compact");
        let compact_file = create_options(self.perms)
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&compact_path)?;
        // the lock has to travel with the file that becomes the log
        compact_file.lock()?;
        let mut compaction_writer = PositionedBufWriter::new(compact_file.try_clone()?)?;

        let mut new_index = BTreeMap::new();
        for (key, rec) in &self.index {
            self.reader.seek(SeekFrom::Start(rec.pos))?;
            let mut record = (&mut self.reader).take(rec.len);
            let pos = compaction_writer.pos;
            let len = io::copy(&mut record, &mut compaction_writer)?;
            new_index.insert(key.clone(), RecordPos { pos, len });
        }
        compaction_writer.flush()?;
        let new_len = compaction_writer.pos;
        drop(compaction_writer);

        remove_if_exists(&self.dir_path)?;
        fs::rename(&compact_path, &self.pag_path)?;

        let mut file = compact_file;
        file.seek(SeekFrom::Start(new_len))?;
        self.writer = Some(PositionedBufWriter::new(file)?);
        self.reader = BufReader::new(File::open(&self.pag_path)?);

        info!(
            "Compacted {} from {} to {} bytes",
            self.pag_path.display(),
            self.log_len,
            new_len
        );

        self.index = new_index;
        self.log_len = new_len;
        self.uncompacted = 0;
        self.save_snapshot()
    }

    fn save_snapshot(&mut self) -> Result<()> {
        let snapshot = DirSnapshot::capture(&self.index, self.log_len, self.uncompacted);
        write_snapshot(&self.dir_path, self.perms, &snapshot)?;
        self.dirty = false;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.dirty && self.writer.is_some() {
            self.save_snapshot()?;
        }
        Ok(())
    }

    // final sync, a failure is reported once and not retried on drop
    fn finish(&mut self) -> Result<()> {
        let res = self.sync();
        self.dirty = false;
        res
    }
}

impl DbmStore for SdbmStore {
    fn fetch(&mut self, key: &[u8]) -> Result<Option<Datum>> {
        let rec = match self.index.get(key) {
            Some(rec) => *rec,
            None => return Ok(None),
        };

        Ok(Some(self.read_value(key, rec)?.into()))
    }

    fn store(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let record = Record::Set {
            key: key.to_vec(),
            val: val.to_vec(),
        };
        let rec = self.append(&record)?;

        if let Record::Set { key, .. } = record {
            // the old record is stale now
            if let Some(old) = self.index.insert(key, rec) {
                self.uncompacted += old.len;
            }
        }
        self.maybe_compact()
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        require_writable(self.mode)?;
        if !self.index.contains_key(key) {
            return Err(DbmErrorKind::KeyNotFound.into());
        }

        let rec = self.append(&Record::Remove { key: key.to_vec() })?;
        if let Some(old) = self.index.remove(key) {
            self.uncompacted += old.len + rec.len;
        }
        self.maybe_compact()
    }

    fn exists(&mut self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    fn firstkey(&mut self) -> Result<Option<Datum>> {
        self.cursor.reset();
        self.nextkey()
    }

    fn nextkey(&mut self) -> Result<Option<Datum>> {
        let index = &self.index;
        self.cursor.step(|from| {
            Ok(index
                .range::<[u8], _>((from, Bound::Unbounded))
                .next()
                .map(|(key, _)| key.clone()))
        })
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.finish()
    }
}

impl Drop for SdbmStore {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            error!("Failed to save index {}: {}", self.dir_path.display(), err);
        }
    }
}

// exclusive for writers, shared for readers, never waits
fn lock_log(file: &File, pag_path: &Path, exclusive: bool) -> Result<()> {
    let res = if exclusive {
        file.try_lock()
    } else {
        file.try_lock_shared()
    };
    match res {
        Ok(()) => Ok(()),
        Err(TryLockError::WouldBlock) => {
            warn!("{} is locked by another handle", pag_path.display());
            Err(DbmErrorKind::Locked.into())
        }
        Err(TryLockError::Error(err)) => Err(err.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, mode: OpenMode) -> Result<SdbmStore> {
        SdbmStore::open(&dir.path().join("db"), mode, FilePerms::default())
    }

    #[test]
    fn reopen_with_and_without_snapshot() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let mut store = open(&dir, OpenMode::RwCreate)?;
        store.store(b"key1", b"value1")?;
        store.store(b"key2", b"value2")?;
        store.delete(b"key1")?;
        Box::new(store).close()?;

        // reopen through the snapshot
        let mut store = open(&dir, OpenMode::ReadWrite)?;
        assert_eq!(store.fetch(b"key1")?, None);
        assert_eq!(store.fetch(b"key2")?, Some(Datum::from("value2")));
        store.store(b"key3", b"value3")?;
        drop(store);

        // reopen by replaying the whole log
        fs::remove_file(dir.path().join("db.dir"))?;
        let mut store = open(&dir, OpenMode::ReadOnly)?;
        assert_eq!(store.fetch(b"key2")?, Some(Datum::from("value2")));
        assert_eq!(store.fetch(b"key3")?, Some(Datum::from("value3")));
        assert!(!store.exists(b"key1"));
        Ok(())
    }

    #[test]
    fn snapshot_plus_tail_replay() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let mut store = open(&dir, OpenMode::RwCreate)?;
        store.store(b"a", b"1")?;
        store.save_snapshot()?;
        // written after the snapshot, only the log knows about these
        store.store(b"b", b"2")?;
        store.store(b"a", b"3")?;
        store.dirty = false;
        drop(store);

        let mut store = open(&dir, OpenMode::ReadOnly)?;
        assert_eq!(store.fetch(b"a")?, Some(Datum::from("3")));
        assert_eq!(store.fetch(b"b")?, Some(Datum::from("2")));
        Ok(())
    }

    #[test]
    fn torn_tail_is_cut_off() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let mut store = open(&dir, OpenMode::RwCreate)?;
        store.store(b"key", b"value")?;
        drop(store);
        fs::remove_file(dir.path().join("db.dir"))?;

        let pag = dir.path().join("db.pag");
        let mut file = fs::OpenOptions::new().append(true).open(&pag)?;
        // tag, key length and half a key of a set record
        file.write_all(&[1, 0, 0, 0, 8, 0, 0, 0, 1, b'h', b'a'])?;
        drop(file);
        let torn_len = fs::metadata(&pag)?.len();

        let mut store = open(&dir, OpenMode::ReadWrite)?;
        assert_eq!(store.fetch(b"key")?, Some(Datum::from("value")));
        assert!(fs::metadata(&pag)?.len() < torn_len);
        store.store(b"next", b"record")?;
        drop(store);

        let mut store = open(&dir, OpenMode::ReadOnly)?;
        assert_eq!(store.fetch(b"next")?, Some(Datum::from("record")));
        Ok(())
    }

    #[test]
    fn compaction_shrinks_log_and_keeps_data() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let pag = dir.path().join("db.pag");
        let mut store = open(&dir, OpenMode::RwCreate)?;
        let val = vec![b'x'; 1024];

        let mut compacted = false;
        let mut last_len = 0;
        for iter in 0..2000u32 {
            let key = format!("key{}", iter % 10);
            store.store(key.as_bytes(), &val)?;
            let len = fs::metadata(&pag)?.len();
            if len < last_len {
                compacted = true;
                break;
            }
            last_len = len;
        }
        assert!(compacted, "No compaction detected");
        assert!(!dir.path().join("db.pag.compact").exists());

        // the lock moved to the compacted log
        let err = open(&dir, OpenMode::ReadWrite).unwrap_err();
        assert_eq!(err.kind(), DbmErrorKind::Locked);
        drop(store);

        let mut store = open(&dir, OpenMode::ReadOnly)?;
        for key_id in 0..10 {
            let key = format!("key{}", key_id);
            assert_eq!(store.fetch(key.as_bytes())?, Some(Datum::from(val.clone())));
        }
        Ok(())
    }

    #[test]
    fn read_only_rejects_writes() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let mut store = open(&dir, OpenMode::RwCreate)?;
        store.store(b"key", b"value")?;
        drop(store);

        let mut store = open(&dir, OpenMode::ReadOnly)?;
        let err = store.store(b"key", b"other").unwrap_err();
        assert_eq!(err.kind(), DbmErrorKind::ReadOnly);
        let err = store.delete(b"key").unwrap_err();
        assert_eq!(err.kind(), DbmErrorKind::ReadOnly);
        assert_eq!(store.fetch(b"key")?, Some(Datum::from("value")));
        Ok(())
    }

    #[test]
    fn truncate_empties_store() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let mut store = open(&dir, OpenMode::RwCreate)?;
        store.store(b"key", b"value")?;
        drop(store);

        let mut store = open(&dir, OpenMode::RwTrunc)?;
        assert_eq!(store.fetch(b"key")?, None);
        assert_eq!(store.firstkey()?, None);
        Ok(())
    }

    #[test]
    fn second_writer_is_locked_out() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let mut writer = open(&dir, OpenMode::RwCreate)?;
        writer.store(b"k1", b"AAAA")?;

        for mode in &[OpenMode::RwCreate, OpenMode::ReadWrite, OpenMode::RwTrunc, OpenMode::ReadOnly] {
            let err = open(&dir, *mode).unwrap_err();
            assert_eq!(err.kind(), DbmErrorKind::Locked, "{:?}", mode);
        }
        // the refused truncate left the data alone
        assert_eq!(writer.fetch(b"k1")?, Some(Datum::from("AAAA")));
        drop(writer);

        // readers share the log, but keep writers out
        let mut reader1 = open(&dir, OpenMode::ReadOnly)?;
        let mut reader2 = open(&dir, OpenMode::ReadOnly)?;
        assert_eq!(reader1.fetch(b"k1")?, Some(Datum::from("AAAA")));
        assert_eq!(reader2.fetch(b"k1")?, Some(Datum::from("AAAA")));
        let err = open(&dir, OpenMode::ReadWrite).unwrap_err();
        assert_eq!(err.kind(), DbmErrorKind::Locked);
        Ok(())
    }

    #[test]
    fn fetch_checks_key_of_record() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let mut store = open(&dir, OpenMode::RwCreate)?;
        store.store(b"k1", b"AAAA")?;
        store.store(b"k2", b"BBBB")?;

        // point k1 at the record of k2
        let rec = store.index[&b"k2"[..]];
        store.index.insert(b"k1".to_vec(), rec);
        let err = store.fetch(b"k1").unwrap_err();
        assert_eq!(err.kind(), DbmErrorKind::CorruptLog);
        assert_eq!(store.fetch(b"k2")?, Some(Datum::from("BBBB")));
        Ok(())
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_replay() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let mut store = open(&dir, OpenMode::RwCreate)?;
        store.store(b"k", b"value")?;
        drop(store);

        fs::write(
            dir.path().join("db.dir"),
            r#"{"log_len":0,"uncompacted":0,"entries":[[[107],18446744073709551615,2]]}"#,
        )?;
        let mut store = open(&dir, OpenMode::ReadOnly)?;
        assert_eq!(store.fetch(b"k")?, Some(Datum::from("value")));
        Ok(())
    }

    #[test]
    fn failed_final_sync_is_not_retried() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let mut store = open(&dir, OpenMode::RwCreate)?;
        store.store(b"k", b"value")?;

        // a directory in place of the snapshot makes writing it fail
        fs::create_dir(dir.path().join("db.dir"))?;
        assert!(store.finish().is_err());
        assert!(!store.dirty);
        // nothing left for drop to write
        assert!(store.sync().is_ok());
        Ok(())
    }
}
