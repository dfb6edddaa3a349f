//! Open modes and the platform agnostic file permission set
//! handed to backends when they create their files.

use std::fmt;
use std::ops::BitOr;

/// How a backend should open its store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// open an existing store for reading only
    ReadOnly,
    /// open an existing store for reading and writing
    ReadWrite,
    /// open for reading and writing, creating the store if missing
    RwCreate,
    /// open for reading and writing, creating the store if missing
    /// and emptying it if it already exists
    RwTrunc,
}

impl OpenMode {
    /// whether handles opened in this mode accept store/delete
    pub fn is_writable(self) -> bool {
        self != OpenMode::ReadOnly
    }

    /// whether a missing store is created instead of reported
    pub fn creates(self) -> bool {
        matches!(self, OpenMode::RwCreate | OpenMode::RwTrunc)
    }
}

/// Permission bits for files created by a backend.
///
/// The owner triple lives at `0x0700`, the group triple at `0x0070`
/// and the world triple at `0x0007`, with set-id and sticky bits above
/// them. Use [FilePerms::posix_mode] to get a POSIX `mode_t` value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilePerms(u32);

impl FilePerms {
    /// set user id
    pub const USETID: FilePerms = FilePerms(0x8000);
    /// owner read
    pub const UREAD: FilePerms = FilePerms(0x0400);
    /// owner write
    pub const UWRITE: FilePerms = FilePerms(0x0200);
    /// owner execute
    pub const UEXECUTE: FilePerms = FilePerms(0x0100);

    /// set group id
    pub const GSETID: FilePerms = FilePerms(0x4000);
    /// group read
    pub const GREAD: FilePerms = FilePerms(0x0040);
    /// group write
    pub const GWRITE: FilePerms = FilePerms(0x0020);
    /// group execute
    pub const GEXECUTE: FilePerms = FilePerms(0x0010);

    /// sticky bit
    pub const WSTICKY: FilePerms = FilePerms(0x2000);
    /// world read
    pub const WREAD: FilePerms = FilePerms(0x0004);
    /// world write
    pub const WWRITE: FilePerms = FilePerms(0x0002);
    /// world execute
    pub const WEXECUTE: FilePerms = FilePerms(0x0001);

    /// owner read/write, group and world read
    pub const OS_DEFAULT: FilePerms = FilePerms(0x0644);

    /// wrap raw permission bits
    pub const fn from_bits(bits: u32) -> Self {
        FilePerms(bits)
    }

    /// raw permission bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// build a permission set from three `rwx` triples,
    /// only the low three bits of each argument are used
    pub fn from_triple(owner: u32, group: u32, world: u32) -> Self {
        FilePerms(((owner & 0o7) << 8) | ((group & 0o7) << 4) | (world & 0o7))
    }

    /// the POSIX mode these permissions correspond to
    pub fn posix_mode(self) -> u32 {
        posix_perms2mode(self)
    }
}

impl Default for FilePerms {
    fn default() -> Self {
        FilePerms::OS_DEFAULT
    }
}

impl BitOr for FilePerms {
    type Output = FilePerms;

    fn bitor(self, rhs: FilePerms) -> FilePerms {
        FilePerms(self.0 | rhs.0)
    }
}

impl fmt::Debug for FilePerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilePerms({:#06x})", self.0)
    }
}

/// Convert a permission set to a POSIX mode.
///
/// Owner bits are off by two, group bits by one and world bits map 1 for 1.
pub fn posix_perms2mode(perms: FilePerms) -> u32 {
    let perm = perms.bits();
    let mut mode = 0;

    mode |= 0o700 & (perm >> 2);
    mode |= 0o070 & (perm >> 1);
    mode |= 0o007 & perm;
    mode
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn full_access_maps_to_0777() {
        assert_eq!(FilePerms::from_triple(7, 7, 7).posix_mode(), 0o777);
    }

    #[test]
    fn single_triples() {
        assert_eq!(FilePerms::from_triple(4, 0, 0).posix_mode(), 0o400);
        assert_eq!(FilePerms::from_triple(0, 2, 0).posix_mode(), 0o020);
        assert_eq!(FilePerms::from_triple(0, 0, 1).posix_mode(), 0o001);
        assert_eq!(FilePerms::OS_DEFAULT.posix_mode(), 0o644);
    }

    #[test]
    fn named_bits_compose() {
        let perms = FilePerms::UREAD | FilePerms::UWRITE | FilePerms::GREAD | FilePerms::WREAD;
        assert_eq!(perms, FilePerms::OS_DEFAULT);
        assert_eq!(perms.posix_mode(), 0o644);
    }

    #[test]
    fn special_bits_are_dropped() {
        let perms = FilePerms::USETID | FilePerms::GSETID | FilePerms::WSTICKY | FilePerms::UREAD;
        assert_eq!(perms.posix_mode(), 0o400);
    }

    #[test]
    fn mapping_is_injective() {
        let mut seen = HashSet::new();
        for owner in 0..8 {
            for group in 0..8 {
                for world in 0..8 {
                    let mode = FilePerms::from_triple(owner, group, world).posix_mode();
                    assert_eq!(mode, (owner << 6) | (group << 3) | world);
                    assert!(seen.insert(mode));
                }
            }
        }
        assert_eq!(seen.len(), 512);
    }

    #[test]
    fn open_modes() {
        assert!(!OpenMode::ReadOnly.is_writable());
        assert!(OpenMode::ReadWrite.is_writable());
        assert!(!OpenMode::ReadWrite.creates());
        assert!(OpenMode::RwCreate.creates());
        assert!(OpenMode::RwTrunc.creates());
    }
}
