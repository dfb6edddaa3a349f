#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

//! This crate provides a dbm-style key-value API, [Dbm], that forwards every call
//! to one of several interchangeable backends implementing the [DbmType] / [DbmStore]
//! traits. Backends are compiled in through cargo features and resolved by name:
//!
//! - `SDBM` (feature `sdbm`): a log-structured store in a `.pag`/`.dir` file pair
//! - `GDBM` (feature `gdbm`): a wrapper around `sled::Db`
//! - `DB` (feature `db`): a wrapper around `redb::Database`
//!
//! The literal name "default" resolves to [DEFAULT_TYPE].

mod datum;
mod dbm;
mod error;
mod perms;
mod registry;
mod storage;

#[macro_use]
extern crate failure;
pub use datum::Datum;
pub use dbm::{get_usednames, get_usednames_ex, Dbm, Keys};
pub use error::{DbmError, DbmErrorKind};
pub use perms::{posix_perms2mode, FilePerms, OpenMode};
pub use registry::{Registry, DEFAULT_TOKEN, DEFAULT_TYPE};
pub use storage::{DbmStore, DbmType};

#[cfg(feature = "db")]
pub use storage::DbType;
#[cfg(feature = "gdbm")]
pub use storage::GdbmType;
#[cfg(feature = "sdbm")]
pub use storage::SdbmType;

/// Result type used by this crate
pub type Result<T> = core::result::Result<T, DbmError>;
