use super::{require_existing, require_writable, Cursor, DbmStore, DbmType};
use crate::{Datum, DbmErrorKind, FilePerms, OpenMode, Result};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Backend wrapping a sled database.
///
/// The store lives in the directory `path`; sled manages the files
/// inside it and their permissions. Keys iterate in byte order.
/// sled itself is thread safe, and so are clones of its handle,
/// but a [Dbm](crate::Dbm) still carries a single cursor.
///
/// # Examples
/// ```
/// # use kvdbm::{Dbm, OpenMode, FilePerms};
/// # use tempfile::TempDir;
///
/// let dir = TempDir::new().unwrap();
/// let path = dir.path().join("db");
/// let mut db = Dbm::open_ex("gdbm", &path, OpenMode::RwCreate, FilePerms::default()).unwrap();
/// db.store("Key", "Value").unwrap();
///
/// assert_eq!(db.fetch("Key").unwrap().unwrap(), "Value");
/// db.close();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct GdbmType;

impl DbmType for GdbmType {
    fn name(&self) -> &'static str {
        "GDBM"
    }

    fn open(&self, path: &Path, mode: OpenMode, _perms: FilePerms) -> Result<Box<dyn DbmStore>> {
        require_existing(path, mode)?;
        if mode == OpenMode::RwTrunc && path.exists() {
            fs::remove_dir_all(path)?;
        }

        let db = sled::Config::new().path(path).open()?;
        debug!("Opened sled database {}", path.display());

        Ok(Box::new(GdbmStore {
            db,
            mode,
            cursor: Cursor::default(),
        }))
    }

    fn usednames(&self, path: &Path) -> (PathBuf, Option<PathBuf>) {
        (path.to_path_buf(), None)
    }
}

struct GdbmStore {
    db: sled::Db,
    mode: OpenMode,
    cursor: Cursor,
}

impl DbmStore for GdbmStore {
    fn fetch(&mut self, key: &[u8]) -> Result<Option<Datum>> {
        let res = self.db.get(key)?;
        Ok(res.map(|ivec| Datum::from(ivec.to_vec())))
    }

    fn store(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        require_writable(self.mode)?;
        self.db.insert(key, val)?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        require_writable(self.mode)?;
        let res = self.db.remove(key)?;
        if res.is_none() {
            Err(DbmErrorKind::KeyNotFound.into())
        } else {
            Ok(())
        }
    }

    fn exists(&mut self, key: &[u8]) -> bool {
        self.db.contains_key(key).unwrap_or(false)
    }

    fn firstkey(&mut self) -> Result<Option<Datum>> {
        self.cursor.reset();
        self.nextkey()
    }

    fn nextkey(&mut self) -> Result<Option<Datum>> {
        let db = &self.db;
        self.cursor.step(|from| {
            let next = db.range::<&[u8], _>((from, Bound::Unbounded)).next();
            match next {
                Some(entry) => {
                    let (key, _) = entry?;
                    Ok(Some(key.to_vec()))
                }
                None => Ok(None),
            }
        })
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
