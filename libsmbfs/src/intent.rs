use bitflags::bitflags;

use crate::error::{Result, SmbFsError};
use crate::rpc::{Rights, ShareAccess};
use crate::slot::SlotKind;

bitflags! {
    /// Open flags as handed over by the filesystem glue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// BSD `O_EXLOCK`: deny every other reader and writer.
        const EXLOCK = 0x04;
        /// BSD `O_SHLOCK`: deny other writers.
        const SHLOCK = 0x08;
        const CREATE = 0x10;
    }
}

impl OpenFlags {
    /// Translate POSIX `open(2)` flags. Deny-mode bits have no POSIX
    /// spelling and are OR-ed in by the caller.
    pub fn from_posix(flags: i32) -> Self {
        let mut out = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => OpenFlags::WRITE,
            libc::O_RDWR => OpenFlags::READ | OpenFlags::WRITE,
            _ => OpenFlags::READ,
        };
        if flags & libc::O_CREAT != 0 {
            out |= OpenFlags::CREATE;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn from_parts(read: bool, write: bool) -> Option<Self> {
        match (read, write) {
            (true, false) => Some(AccessMode::Read),
            (false, true) => Some(AccessMode::Write),
            (true, true) => Some(AccessMode::ReadWrite),
            (false, false) => None,
        }
    }

    pub fn from_rights(rights: Rights) -> Option<Self> {
        Self::from_parts(rights.can_read(), rights.can_write())
    }

    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }

    /// True when a handle opened with `self` can serve `other`.
    pub fn covers(self, other: AccessMode) -> bool {
        (!other.can_read() || self.can_read()) && (!other.can_write() || self.can_write())
    }

    pub fn union(self, other: AccessMode) -> AccessMode {
        Self::from_parts(
            self.can_read() || other.can_read(),
            self.can_write() || other.can_write(),
        )
        .unwrap_or(self)
    }

    /// Data rights needed for this mode.
    pub fn data_rights(self) -> Rights {
        let mut rights = Rights::empty();
        if self.can_read() {
            rights |= Rights::READ_DATA;
        }
        if self.can_write() {
            rights |= Rights::WRITE_DATA | Rights::APPEND_DATA;
        }
        rights
    }
}

/// What a local open wants, decided once at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenIntent {
    SharedAccess { access: AccessMode },
    ExclusiveLock { access: AccessMode },
    ShareLock { access: AccessMode },
}

impl OpenIntent {
    pub fn from_flags(flags: OpenFlags) -> Result<Self> {
        let access = AccessMode::from_parts(
            flags.contains(OpenFlags::READ),
            flags.contains(OpenFlags::WRITE),
        )
        .ok_or_else(|| SmbFsError::Invalid("open without read or write access".into()))?;
        match (
            flags.contains(OpenFlags::EXLOCK),
            flags.contains(OpenFlags::SHLOCK),
        ) {
            (true, true) => Err(SmbFsError::Invalid(
                "O_EXLOCK and O_SHLOCK are mutually exclusive".into(),
            )),
            (true, false) => Ok(OpenIntent::ExclusiveLock { access }),
            (false, true) => Ok(OpenIntent::ShareLock { access }),
            (false, false) => Ok(OpenIntent::SharedAccess { access }),
        }
    }

    pub fn access(&self) -> AccessMode {
        match *self {
            OpenIntent::SharedAccess { access }
            | OpenIntent::ExclusiveLock { access }
            | OpenIntent::ShareLock { access } => access,
        }
    }

    pub fn slot(&self) -> SlotKind {
        match self {
            OpenIntent::SharedAccess { .. } => SlotKind::Shared,
            OpenIntent::ExclusiveLock { .. } | OpenIntent::ShareLock { .. } => SlotKind::Exclusive,
        }
    }

    /// Share mode granted to other openers.
    pub fn share_access(&self) -> ShareAccess {
        match self {
            OpenIntent::SharedAccess { .. } => ShareAccess::all(),
            OpenIntent::ExclusiveLock { .. } => ShareAccess::DELETE,
            OpenIntent::ShareLock { .. } => ShareAccess::READ | ShareAccess::DELETE,
        }
    }

    /// Same deny semantics, ignoring access.
    pub fn same_kind(&self, other: &OpenIntent) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
