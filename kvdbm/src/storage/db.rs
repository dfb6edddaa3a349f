use super::{apply_perms, require_existing, require_writable, Cursor, DbmStore, DbmType};
use crate::{Datum, DbmErrorKind, FilePerms, OpenMode, Result};
use redb::{Database, ReadOnlyTable, ReadableDatabase, TableDefinition, TableError};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::debug;

const TABLE: TableDefinition<'static, &[u8], &[u8]> = TableDefinition::new("kvdbm");

/// Backend wrapping a redb database kept in the single file `path`.
///
/// Every store and delete commits its own write transaction.
/// Keys iterate in byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbType;

impl DbmType for DbType {
    fn name(&self) -> &'static str {
        "DB"
    }

    fn open(&self, path: &Path, mode: OpenMode, perms: FilePerms) -> Result<Box<dyn DbmStore>> {
        require_existing(path, mode)?;
        if mode == OpenMode::RwTrunc && path.exists() {
            fs::remove_file(path)?;
        }

        let created = !path.exists();
        let db = if mode.creates() {
            Database::create(path)?
        } else {
            Database::open(path)?
        };
        if created {
            apply_perms(path, perms)?;
        }

        // create the table up front so readers never miss it
        if mode.is_writable() {
            let txn = db.begin_write()?;
            txn.open_table(TABLE)?;
            txn.commit()?;
        }
        debug!("Opened redb database {}", path.display());

        Ok(Box::new(DbStore {
            db,
            mode,
            cursor: Cursor::default(),
        }))
    }

    fn usednames(&self, path: &Path) -> (PathBuf, Option<PathBuf>) {
        (path.to_path_buf(), None)
    }
}

struct DbStore {
    db: Database,
    mode: OpenMode,
    cursor: Cursor,
}

// a read-only handle on a file never written through this backend
// has no table yet, which reads as an empty store
fn read_table(db: &Database) -> Result<Option<ReadOnlyTable<&'static [u8], &'static [u8]>>> {
    let txn = db.begin_read()?;
    match txn.open_table(TABLE) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

impl DbmStore for DbStore {
    fn fetch(&mut self, key: &[u8]) -> Result<Option<Datum>> {
        let table = match read_table(&self.db)? {
            Some(table) => table,
            None => return Ok(None),
        };
        let val = table.get(key)?.map(|guard| Datum::from(guard.value()));
        Ok(val)
    }

    fn store(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        require_writable(self.mode)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TABLE)?;
            table.insert(key, val)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        require_writable(self.mode)?;
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(TABLE)?;
            let old = table.remove(key)?;
            old.is_some()
        };

        if removed {
            txn.commit()?;
            Ok(())
        } else {
            txn.abort()?;
            Err(DbmErrorKind::KeyNotFound.into())
        }
    }

    fn exists(&mut self, key: &[u8]) -> bool {
        matches!(self.fetch(key), Ok(Some(_)))
    }

    fn firstkey(&mut self) -> Result<Option<Datum>> {
        self.cursor.reset();
        self.nextkey()
    }

    fn nextkey(&mut self) -> Result<Option<Datum>> {
        let db = &self.db;
        self.cursor.step(|from| {
            let table = match read_table(db)? {
                Some(table) => table,
                None => return Ok(None),
            };
            let mut range = table.range::<&[u8]>((from, Bound::Unbounded))?;
            match range.next() {
                Some(entry) => {
                    let (key, _) = entry?;
                    Ok(Some(key.value().to_vec()))
                }
                None => Ok(None),
            }
        })
    }

    fn close(self: Box<Self>) -> Result<()> {
        // redb commits durably per transaction, dropping the
        // database releases its file lock
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn delete_missing_key_leaves_store_untouched() -> Result<()> {
        let dir = TempDir::new().expect("unable to create temporary working directory");
        let path = dir.path().join("db");
        let mut store = DbType.open(&path, OpenMode::RwCreate, FilePerms::default())?;
        store.store(b"key", b"value")?;

        let err = store.delete(b"other").unwrap_err();
        assert_eq!(err.kind(), DbmErrorKind::KeyNotFound);
        assert_eq!(store.fetch(b"key")?, Some(Datum::from("value")));
        store.close()
    }

    #[cfg(unix)]
    #[test]
    fn new_file_gets_requested_mode() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("unable to create temporary working directory");
        let path = dir.path().join("db");
        let store = DbType.open(&path, OpenMode::RwCreate, FilePerms::from_triple(6, 0, 0))?;
        store.close()?;

        let mode = fs::metadata(&path)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }
}
