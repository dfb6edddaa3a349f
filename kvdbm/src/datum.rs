use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

/// A length-delimited byte sequence returned by a backend,
/// either a key (from the cursor) or a value (from fetch).
///
/// A `Datum` owns its bytes. Hand it back through
/// [Dbm::freedatum](crate::Dbm::freedatum) or simply drop it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Datum(Vec<u8>);

impl Datum {
    /// wrap owned bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Datum(bytes)
    }

    /// number of bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// whether the datum holds no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// the bytes as a slice
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// take the bytes out
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for Datum {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Datum {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for Datum {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Datum {
    fn from(bytes: Vec<u8>) -> Self {
        Datum(bytes)
    }
}

impl From<&[u8]> for Datum {
    fn from(bytes: &[u8]) -> Self {
        Datum(bytes.to_vec())
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum(s.as_bytes().to_vec())
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum(s.into_bytes())
    }
}

impl From<Datum> for Vec<u8> {
    fn from(datum: Datum) -> Vec<u8> {
        datum.0
    }
}

impl PartialEq<[u8]> for Datum {
    fn eq(&self, other: &[u8]) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Datum {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.as_bytes()
    }
}

impl fmt::Debug for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Datum({:?})", s),
            Err(_) => write!(f, "Datum({:?})", self.0),
        }
    }
}
