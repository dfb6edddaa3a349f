use crate::registry::{Registry, DEFAULT_TOKEN};
use crate::storage::{DbmStore, DbmType};
use crate::{Datum, FilePerms, OpenMode, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Handle to one open key-value store.
///
/// Every call is forwarded to the backend the handle was opened with.
/// The outcome of the latest fallible call is kept on the handle and
/// can be read back with [Dbm::geterror].
///
/// ```rust
/// use kvdbm::{Dbm, OpenMode, FilePerms};
/// use tempfile::TempDir;
///
/// let temp_dir = TempDir::new().unwrap();
/// let path = temp_dir.path().join("store");
/// let mut db = Dbm::open(&path, OpenMode::RwCreate, FilePerms::default()).unwrap();
///
/// db.store("key", "value").unwrap();
/// assert_eq!(Some("value".into()), db.fetch("key").unwrap());
///
/// db.delete("key").unwrap();
/// assert_eq!(None, db.fetch("key").unwrap());
/// db.close();
/// ```
pub struct Dbm {
    dbm_type: Arc<dyn DbmType>,
    path: PathBuf,
    store: Box<dyn DbmStore>,
    // outcome of the latest fallible operation, 0 for success
    errcode: i32,
    errmsg: Option<String>,
}

impl Dbm {
    /// open the store at `path` with the backend called `name`,
    /// matched case-insensitively against the compiled-in backends,
    /// or with the default backend for the literal "default"
    pub fn open_ex(
        name: &str,
        path: impl AsRef<Path>,
        mode: OpenMode,
        perms: FilePerms,
    ) -> Result<Dbm> {
        Registry::builtin().open(name, path, mode, perms)
    }

    /// open the store at `path` with the default backend,
    /// see [DEFAULT_TYPE](crate::DEFAULT_TYPE)
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, perms: FilePerms) -> Result<Dbm> {
        Self::open_ex(DEFAULT_TOKEN, path, mode, perms)
    }

    pub(crate) fn from_type(
        dbm_type: Arc<dyn DbmType>,
        path: &Path,
        mode: OpenMode,
        perms: FilePerms,
    ) -> Result<Dbm> {
        debug!(
            "Opening {} as {} ({:?}, {:?})",
            path.display(),
            dbm_type.name(),
            mode,
            perms
        );
        let store = dbm_type.open(path, mode, perms)?;

        Ok(Dbm {
            dbm_type,
            path: path.to_path_buf(),
            store,
            errcode: 0,
            errmsg: None,
        })
    }

    /// close the store, the backend releases everything the handle owns
    pub fn close(self) {
        let Dbm {
            dbm_type,
            path,
            store,
            ..
        } = self;

        if let Err(err) = store.close() {
            error!(
                "Closing {} ({}) failed: {}",
                path.display(),
                dbm_type.name(),
                err.message()
            );
        } else {
            debug!("Closed {} ({})", path.display(), dbm_type.name());
        }
    }

    /// get a copy of the value stored under key,
    /// `None` if the key is absent
    pub fn fetch(&mut self, key: impl AsRef<[u8]>) -> Result<Option<Datum>> {
        let res = self.store.fetch(key.as_ref());
        self.record(res)
    }

    /// insert or overwrite the value of key
    pub fn store(&mut self, key: impl AsRef<[u8]>, val: impl AsRef<[u8]>) -> Result<()> {
        let res = self.store.store(key.as_ref(), val.as_ref());
        self.record(res)
    }

    /// remove key, all bundled backends report an absent key
    /// as [KeyNotFound](crate::DbmErrorKind::KeyNotFound)
    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> Result<()> {
        let res = self.store.delete(key.as_ref());
        self.record(res)
    }

    /// whether key is present, a backend failure reads as absent.
    /// The recorded error state is left untouched.
    pub fn exists(&mut self, key: impl AsRef<[u8]>) -> bool {
        self.store.exists(key.as_ref())
    }

    /// restart iteration and return the first key,
    /// `None` for an empty store
    pub fn firstkey(&mut self) -> Result<Option<Datum>> {
        let res = self.store.firstkey();
        self.record(res)
    }

    /// the key after the one last returned, `None` once all keys
    /// present when iteration started have been returned
    pub fn nextkey(&mut self) -> Result<Option<Datum>> {
        let res = self.store.nextkey();
        self.record(res)
    }

    /// give back a datum returned by this handle
    pub fn freedatum(&mut self, datum: Datum) {
        drop(datum);
    }

    /// iterate over all keys, restarting the handle's cursor
    pub fn keys(&mut self) -> Keys<'_> {
        Keys {
            dbm: self,
            started: false,
            done: false,
        }
    }

    /// code and message of the latest outcome, the message is cut to at
    /// most `capacity` bytes. Code 0 with an empty message means the latest
    /// operation succeeded.
    pub fn geterror(&self, capacity: usize) -> (i32, String) {
        let msg = self.errmsg.as_deref().unwrap_or("");
        let mut end = msg.len().min(capacity);
        while !msg.is_char_boundary(end) {
            end -= 1;
        }
        (self.errcode, msg[..end].to_owned())
    }

    /// code of the latest outcome, 0 for success
    pub fn errcode(&self) -> i32 {
        self.errcode
    }

    /// full message of the latest failure
    pub fn errmsg(&self) -> Option<&str> {
        self.errmsg.as_deref()
    }

    /// name of the backend serving this handle
    pub fn type_name(&self) -> &'static str {
        self.dbm_type.name()
    }

    /// the logical path the handle was opened with
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record<T>(&mut self, res: Result<T>) -> Result<T> {
        match &res {
            Ok(_) => {
                self.errcode = 0;
                self.errmsg = None;
            }
            Err(err) => {
                self.errcode = err.code();
                self.errmsg = Some(err.message());
                debug!(
                    "{} ({}) failed with {}: {}",
                    self.path.display(),
                    self.dbm_type.name(),
                    self.errcode,
                    err.message()
                );
            }
        }
        res
    }
}

impl fmt::Debug for Dbm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dbm")
            .field("type", &self.dbm_type.name())
            .field("path", &self.path)
            .field("errcode", &self.errcode)
            .field("errmsg", &self.errmsg)
            .finish()
    }
}

/// Iterator over the keys of a [Dbm], see [Dbm::keys]
#[derive(Debug)]
pub struct Keys<'a> {
    dbm: &'a mut Dbm,
    started: bool,
    done: bool,
}

impl Iterator for Keys<'_> {
    type Item = Result<Datum>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let res = if self.started {
            self.dbm.nextkey()
        } else {
            self.started = true;
            self.dbm.firstkey()
        };

        match res {
            Ok(Some(key)) => Some(Ok(key)),
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

/// file names the backend called `name` would use for the logical
/// `path`, without opening anything
pub fn get_usednames_ex(name: &str, path: impl AsRef<Path>) -> Result<(PathBuf, Option<PathBuf>)> {
    Registry::builtin().usednames(name, path)
}

/// file names the default backend would use for the logical `path`
pub fn get_usednames(path: impl AsRef<Path>) -> Result<(PathBuf, Option<PathBuf>)> {
    get_usednames_ex(DEFAULT_TOKEN, path)
}
