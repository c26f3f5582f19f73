//! RPC seam towards the SMB transport.
//!
//! Message encoding lives below this trait. The core only needs the
//! open/close/lock primitives, lease-break acknowledgement and durable
//! reclaim, expressed with wire-neutral types.

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bitflags::bitflags;
use uuid::Uuid;

use crate::error::RpcError;

/// Server-side file handle identifier. Zero is never handed out.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    pub const NONE: HandleId = HandleId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fid:{:#x}", self.0)
    }
}

/// 128-bit lease key, one per file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseKey(pub u128);

impl LeaseKey {
    pub fn random() -> Self {
        LeaseKey(Uuid::new_v4().as_u128())
    }
}

impl fmt::Debug for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease:{}", Uuid::from_u128(self.0))
    }
}

bitflags! {
    /// Access rights requested on open.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Rights: u32 {
        const READ_DATA = 0x0000_0001;
        const WRITE_DATA = 0x0000_0002;
        const APPEND_DATA = 0x0000_0004;
        const READ_EA = 0x0000_0008;
        const WRITE_EA = 0x0000_0010;
        const READ_ATTRIBUTES = 0x0000_0080;
        const WRITE_ATTRIBUTES = 0x0000_0100;
        const DELETE = 0x0001_0000;
        const READ_CONTROL = 0x0002_0000;
        const WRITE_DAC = 0x0004_0000;
        const SYNCHRONIZE = 0x0010_0000;
    }
}

impl Rights {
    pub fn can_read(&self) -> bool {
        self.contains(Rights::READ_DATA)
    }

    pub fn can_write(&self) -> bool {
        self.intersects(Rights::WRITE_DATA | Rights::APPEND_DATA)
    }
}

bitflags! {
    /// Share mode: what other openers are still allowed to do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShareAccess: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const DELETE = 0x4;
    }
}

bitflags! {
    /// Lease caching levels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LeaseState: u32 {
        const READ_CACHING = 0x1;
        const HANDLE_CACHING = 0x2;
        const WRITE_CACHING = 0x4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloseFlags: u16 {
        /// Ask the server to return attributes with the close reply.
        const POSTQUERY_ATTRIB = 0x0001;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    /// Fail when the file does not exist.
    Open,
    /// Open, creating the file when it does not exist.
    OpenIf,
    /// Fail when the file already exists.
    Create,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: u64,
    /// Monotonic change counter maintained by the server.
    pub change_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRequest {
    pub key: LeaseKey,
    pub state: LeaseState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableRequest {
    pub create_guid: Uuid,
    pub timeout: Duration,
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableGrant {
    pub timeout: Duration,
    pub persistent: bool,
}

#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub path: String,
    pub rights: Rights,
    pub share: ShareAccess,
    pub disposition: CreateDisposition,
    pub lease: Option<LeaseRequest>,
    pub durable: Option<DurableRequest>,
}

#[derive(Debug, Clone)]
pub struct OpenReply {
    pub handle: HandleId,
    pub lease: Option<LeaseState>,
    pub durable: Option<DurableGrant>,
    pub attrs: FileAttrs,
}

#[derive(Debug, Clone)]
pub struct ReclaimRequest {
    pub path: String,
    pub create_guid: Uuid,
    pub rights: Rights,
    pub share: ShareAccess,
    pub lease: Option<LeaseRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    pub handle: HandleId,
    pub owner_pid: u32,
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
    /// Zero means fail immediately on conflict.
    pub timeout: Duration,
}

/// Primitives consumed from the transport.
#[async_trait]
pub trait SmbRpc: Send + Sync {
    async fn open(&self, req: &OpenRequest) -> Result<OpenReply, RpcError>;

    async fn close(&self, handle: HandleId, flags: CloseFlags)
    -> Result<Option<FileAttrs>, RpcError>;

    async fn lock(&self, req: &LockRequest) -> Result<(), RpcError>;

    async fn unlock(&self, req: &LockRequest) -> Result<(), RpcError>;

    async fn read(&self, handle: HandleId, offset: u64, len: usize) -> Result<Vec<u8>, RpcError>;

    async fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<usize, RpcError>;

    /// Reconnect a durable/persistent handle identified by its create GUID.
    async fn reclaim_durable(&self, req: &ReclaimRequest) -> Result<OpenReply, RpcError>;

    async fn lease_break_ack(&self, key: LeaseKey, state: LeaseState) -> Result<(), RpcError>;

    async fn delete(&self, path: &str) -> Result<(), RpcError>;
}
