//! Durable/persistent handle tracking.
//!
//! Every open asks for a durable handle (persistent on continuously available
//! shares). The grant is recorded per handle and is the only input needed to
//! reclaim the handle after a session drop. The create GUID is kept verbatim
//! across a reclaim attempt and only replaced by the next fresh open.

use std::time::Duration;

use bitflags::bitflags;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::rpc::{DurableGrant, DurableRequest, HandleId, LeaseRequest, ReclaimRequest, Rights, ShareAccess};

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DurableFlags: u8 {
        const REQUESTED = 0x1;
        const GRANTED = 0x2;
        const PERSISTENT = 0x4;
    }
}

#[derive(Debug, Clone, Default)]
pub struct DurableHandleInfo {
    pub flags: DurableFlags,
    pub handle: HandleId,
    pub timeout: Duration,
    pub create_guid: Option<Uuid>,
}

impl DurableHandleInfo {
    /// Build the durable part of a fresh open. A new create GUID is minted
    /// because it identifies this particular open to the server.
    pub fn prepare_request(&mut self, config: &ClientConfig) -> DurableRequest {
        let create_guid = Uuid::new_v4();
        self.flags = DurableFlags::REQUESTED;
        self.handle = HandleId::NONE;
        self.create_guid = Some(create_guid);
        self.timeout = config.durable_timeout();
        DurableRequest {
            create_guid,
            timeout: self.timeout,
            persistent: config.persistent_handles,
        }
    }

    pub fn record_grant(&mut self, handle: HandleId, grant: Option<&DurableGrant>) {
        match grant {
            Some(grant) => {
                self.flags |= DurableFlags::GRANTED;
                self.flags.set(DurableFlags::PERSISTENT, grant.persistent);
                self.handle = handle;
                if !grant.timeout.is_zero() {
                    self.timeout = grant.timeout;
                }
            }
            None => {
                self.flags.remove(DurableFlags::GRANTED | DurableFlags::PERSISTENT);
                self.handle = HandleId::NONE;
            }
        }
    }

    pub fn is_granted(&self) -> bool {
        self.flags.contains(DurableFlags::GRANTED)
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.contains(DurableFlags::PERSISTENT)
    }

    pub fn is_reclaimable(&self) -> bool {
        self.is_granted() && self.create_guid.is_some() && self.handle.is_valid()
    }

    pub fn reclaim_request(
        &self,
        path: &str,
        rights: Rights,
        share: ShareAccess,
        lease: Option<LeaseRequest>,
    ) -> Option<ReclaimRequest> {
        if !self.is_reclaimable() {
            return None;
        }
        Some(ReclaimRequest {
            path: path.to_string(),
            create_guid: self.create_guid?,
            rights,
            share,
            lease,
        })
    }

    pub fn clear(&mut self) {
        *self = DurableHandleInfo::default();
    }
}
