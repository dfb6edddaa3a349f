use failure::{Backtrace, Context, Fail};
use std::fmt;
use std::io;

/// Error Type for the dbm dispatcher and its backends
#[derive(Debug)]
pub struct DbmError {
    inner: Context<DbmErrorKind>,
}

/// Kinds of possible Errors surfaced through a [Dbm](crate::Dbm) handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Fail)]
pub enum DbmErrorKind {
    /// The requested backend name matches none of the compiled-in backends
    #[fail(display = "Backend not implemented")]
    NotImplemented,
    /// Try to remove a non-existent key
    #[fail(display = "Key not found")]
    KeyNotFound,
    /// Write attempted through a handle opened read-only
    #[fail(display = "Database opened read-only")]
    ReadOnly,
    /// The store is held by another handle
    #[fail(display = "Database locked by another handle")]
    Locked,
    /// IoError triggered by file I/Os
    #[fail(display = "Io Error")]
    IoError,
    /// A record in the sdbm log could not be decoded
    #[fail(display = "Corrupt log record")]
    CorruptLog,
    /// Serialization/Deserialization Error triggered by serde
    #[fail(display = "Json parsing error")]
    JsonError,
    /// Error triggered by sled engine
    #[fail(display = "Sled Error")]
    SledError,
    /// Error triggered by redb engine
    #[fail(display = "Redb Error")]
    RedbError,
}

impl DbmErrorKind {
    /// numeric status code of this kind, `IoError` prefers the OS errno
    /// when one is known, see [DbmError::code]
    pub fn code(self) -> i32 {
        match self {
            DbmErrorKind::NotImplemented => 70023,
            DbmErrorKind::IoError => 70014,
            DbmErrorKind::KeyNotFound => 70015,
            DbmErrorKind::ReadOnly => 70016,
            DbmErrorKind::CorruptLog => 70017,
            DbmErrorKind::JsonError => 70018,
            DbmErrorKind::SledError => 70019,
            DbmErrorKind::RedbError => 70020,
            DbmErrorKind::Locked => 70021,
        }
    }
}

impl DbmError {
    /// get the kind of the error
    pub fn kind(&self) -> DbmErrorKind {
        *self.inner.get_context()
    }

    /// numeric status code recorded on the handle for this error
    pub fn code(&self) -> i32 {
        if let Some(errno) = self
            .inner
            .cause()
            .and_then(|cause| cause.downcast_ref::<io::Error>())
            .and_then(io::Error::raw_os_error)
        {
            return errno;
        }
        self.kind().code()
    }

    /// human readable message: the kind followed by its underlying cause
    pub fn message(&self) -> String {
        match self.inner.cause() {
            Some(cause) => format!("{}: {}", self.kind(), cause),
            None => self.kind().to_string(),
        }
    }
}

impl Fail for DbmError {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for DbmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<DbmErrorKind> for DbmError {
    fn from(kind: DbmErrorKind) -> DbmError {
        DbmError {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<DbmErrorKind>> for DbmError {
    fn from(context: Context<DbmErrorKind>) -> DbmError {
        DbmError { inner: context }
    }
}

impl From<io::Error> for DbmError {
    fn from(error: io::Error) -> DbmError {
        error.context(DbmErrorKind::IoError).into()
    }
}

impl From<serde_json::Error> for DbmError {
    fn from(error: serde_json::Error) -> DbmError {
        error.context(DbmErrorKind::JsonError).into()
    }
}

#[cfg(feature = "gdbm")]
impl From<sled::Error> for DbmError {
    fn from(error: sled::Error) -> DbmError {
        error.context(DbmErrorKind::SledError).into()
    }
}

// redb splits its failures across several types, all of which
// fold into redb::Error
#[cfg(feature = "db")]
macro_rules! from_redb {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for DbmError {
                fn from(error: $err) -> DbmError {
                    redb::Error::from(error).context(DbmErrorKind::RedbError).into()
                }
            }
        )*
    };
}

#[cfg(feature = "db")]
from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

#[cfg(feature = "db")]
impl From<redb::Error> for DbmError {
    fn from(error: redb::Error) -> DbmError {
        error.context(DbmErrorKind::RedbError).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_code_prefers_errno() {
        let err: DbmError = io::Error::from_raw_os_error(2).into();
        assert_eq!(err.kind(), DbmErrorKind::IoError);
        assert_eq!(err.code(), 2);
        assert!(err.message().starts_with("Io Error: "));
    }

    #[test]
    fn kind_without_cause() {
        let err: DbmError = DbmErrorKind::NotImplemented.into();
        assert_eq!(err.code(), 70023);
        assert_eq!(err.message(), "Backend not implemented");
    }

    #[test]
    fn synthetic_io_error_falls_back_to_kind_code() {
        let err: DbmError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(err.code(), DbmErrorKind::IoError.code());
        assert_eq!(err.message(), "Io Error: boom");
    }
}
