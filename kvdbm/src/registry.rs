//! Name to backend resolution.

use crate::storage::DbmType;
use crate::{Dbm, DbmErrorKind, FilePerms, OpenMode, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;

#[cfg(not(any(feature = "sdbm", feature = "gdbm", feature = "db")))]
compile_error!("a dbm backend was not specified, enable one of the `sdbm`, `gdbm` or `db` features");

/// Name of the backend "default" resolves to in this build
#[cfg(feature = "sdbm")]
pub const DEFAULT_TYPE: &str = "SDBM";
/// Name of the backend "default" resolves to in this build
#[cfg(all(not(feature = "sdbm"), feature = "gdbm"))]
pub const DEFAULT_TYPE: &str = "GDBM";
/// Name of the backend "default" resolves to in this build
#[cfg(all(not(feature = "sdbm"), not(feature = "gdbm"), feature = "db"))]
pub const DEFAULT_TYPE: &str = "DB";

/// The token that selects the build's default backend
pub const DEFAULT_TOKEN: &str = "default";

/// A set of backends addressable by name.
///
/// Names are matched case-insensitively. The literal "default" resolves
/// to the registry's default backend, which for [Registry::builtin] is
/// [DEFAULT_TYPE].
#[derive(Clone)]
pub struct Registry {
    // keyed by lowercase name
    types: BTreeMap<String, Arc<dyn DbmType>>,
    default: Option<String>,
}

impl Registry {
    /// an empty registry, see [Registry::with]
    pub fn new() -> Self {
        Self {
            types: BTreeMap::new(),
            default: None,
        }
    }

    /// the backends compiled into this build, built once per process
    pub fn builtin() -> &'static Registry {
        static BUILTIN: OnceLock<Registry> = OnceLock::new();
        BUILTIN.get_or_init(|| {
            let registry = Registry::new();
            #[cfg(feature = "gdbm")]
            let registry = registry.with(crate::storage::GdbmType);
            #[cfg(feature = "sdbm")]
            let registry = registry.with(crate::storage::SdbmType);
            #[cfg(feature = "db")]
            let registry = registry.with(crate::storage::DbType);
            registry.with_default(DEFAULT_TYPE)
        })
    }

    /// register a backend under its [name](DbmType::name),
    /// replacing any backend registered under the same name.
    /// The first backend registered becomes the default.
    pub fn with<T: DbmType + 'static>(mut self, dbm_type: T) -> Self {
        let name = dbm_type.name().to_ascii_lowercase();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.types.insert(name, Arc::new(dbm_type));
        self
    }

    /// make the registered backend `name` the default
    pub fn with_default(mut self, name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if self.types.contains_key(&name) {
            self.default = Some(name);
        }
        self
    }

    /// names of the registered backends, as the backends spell them
    pub fn names(&self) -> Vec<&'static str> {
        self.types.values().map(|t| t.name()).collect()
    }

    /// the default backend, `None` for an empty registry
    pub fn default_type(&self) -> Option<&Arc<dyn DbmType>> {
        self.default.as_ref().and_then(|name| self.types.get(name))
    }

    /// find the backend called `name` or, for "default", the default one
    pub fn resolve(&self, name: &str) -> Result<&Arc<dyn DbmType>> {
        let resolved = if name.eq_ignore_ascii_case(DEFAULT_TOKEN) {
            self.default_type()
        } else {
            self.types.get(&name.to_ascii_lowercase())
        };

        match resolved {
            Some(dbm_type) => {
                debug!("Resolved dbm type {:?} to {}", name, dbm_type.name());
                Ok(dbm_type)
            }
            None => {
                debug!("No dbm type named {:?}", name);
                Err(DbmErrorKind::NotImplemented.into())
            }
        }
    }

    /// open a store through the backend called `name`
    pub fn open(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        mode: OpenMode,
        perms: FilePerms,
    ) -> Result<Dbm> {
        let dbm_type = self.resolve(name)?;
        Dbm::from_type(Arc::clone(dbm_type), path.as_ref(), mode, perms)
    }

    /// file names the backend called `name` would use for `path`
    pub fn usednames(&self, name: &str, path: impl AsRef<Path>) -> Result<(PathBuf, Option<PathBuf>)> {
        Ok(self.resolve(name)?.usednames(path.as_ref()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.names())
            .field("default", &self.default)
            .finish()
    }
}
