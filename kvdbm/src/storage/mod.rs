#[cfg(feature = "db")]
mod db;
#[cfg(feature = "gdbm")]
mod gdbm;
#[cfg(feature = "sdbm")]
mod sdbm;
#[cfg(feature = "sdbm")]
mod sdbm_util;

#[cfg(feature = "db")]
pub use db::DbType;
#[cfg(feature = "gdbm")]
pub use gdbm::GdbmType;
#[cfg(feature = "sdbm")]
pub use sdbm::SdbmType;

use crate::{Datum, FilePerms, OpenMode, Result};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// A kind of key-value backend, the entry point of its operation set.
///
/// One value of each implementing type is registered in a
/// [Registry](crate::Registry) under [DbmType::name].
pub trait DbmType: Send + Sync {
    /// the name this backend is resolved by, matched case-insensitively
    fn name(&self) -> &'static str;

    /// open (and depending on `mode` create or truncate) the store at `path`
    fn open(&self, path: &Path, mode: OpenMode, perms: FilePerms) -> Result<Box<dyn DbmStore>>;

    /// the file system names this backend uses for the logical `path`,
    /// some backends split one database across two files
    fn usednames(&self, path: &Path) -> (PathBuf, Option<PathBuf>);
}

/// Operations on one open store.
///
/// Implementations keep a single forward cursor for
/// [firstkey](DbmStore::firstkey) / [nextkey](DbmStore::nextkey).
pub trait DbmStore: Send {
    /// get a copy of the value stored under key,
    /// `None` if the key is absent
    fn fetch(&mut self, key: &[u8]) -> Result<Option<Datum>>;

    /// insert or overwrite the value of key
    fn store(&mut self, key: &[u8], val: &[u8]) -> Result<()>;

    /// remove key
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// whether key is present
    fn exists(&mut self, key: &[u8]) -> bool;

    /// reset the cursor and return the first key
    fn firstkey(&mut self) -> Result<Option<Datum>>;

    /// advance the cursor, `None` once every key has been visited
    fn nextkey(&mut self) -> Result<Option<Datum>>;

    /// release the store, persisting whatever the backend buffers
    fn close(self: Box<Self>) -> Result<()>;
}

/// Iteration position shared by the backends, all of which
/// can look up "the first key after X" in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Cursor {
    Start,
    After(Vec<u8>),
    End,
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::Start
    }
}

impl Cursor {
    /// move to the key following the current position, `seek` is asked
    /// for the first key within the given lower bound
    pub(crate) fn step<F>(&mut self, seek: F) -> Result<Option<Datum>>
    where
        F: FnOnce(Bound<&[u8]>) -> Result<Option<Vec<u8>>>,
    {
        let next = match self {
            Cursor::End => return Ok(None),
            Cursor::Start => seek(Bound::Unbounded)?,
            Cursor::After(last) => seek(Bound::Excluded(last.as_slice()))?,
        };

        *self = match &next {
            Some(key) => Cursor::After(key.clone()),
            None => Cursor::End,
        };
        Ok(next.map(Datum::from))
    }

    pub(crate) fn reset(&mut self) {
        *self = Cursor::Start;
    }
}

// stores opened without a create flag must already exist,
// the metadata call surfaces the OS error
pub(crate) fn require_existing(path: &Path, mode: OpenMode) -> Result<()> {
    if !mode.creates() {
        fs::metadata(path)?;
    }
    Ok(())
}

pub(crate) fn require_writable(mode: OpenMode) -> Result<()> {
    if mode.is_writable() {
        Ok(())
    } else {
        Err(crate::DbmErrorKind::ReadOnly.into())
    }
}

#[cfg(unix)]
pub(crate) fn apply_perms(path: &Path, perms: FilePerms) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(perms.posix_mode()))?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn apply_perms(_path: &Path, _perms: FilePerms) -> Result<()> {
    Ok(())
}
