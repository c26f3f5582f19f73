// Library crate for the SMB client handle core: the per-file open handle
// lifecycle sitting between a filesystem front end and the SMB transport.

pub mod brl;
pub mod config;
pub mod deferred;
pub mod durable;
pub mod error;
pub mod handle_set;
pub mod intent;
pub mod lease;
pub mod node;
pub mod reconnect;
pub mod rpc;
pub mod share;
pub mod slot;

pub use config::{ClientConfig, DeferredReusePolicy};
pub use error::{Result, RpcError, SmbFsError};
pub use handle_set::{CloseMode, CloseOutcome, FileHandleSet, HandleToken};
pub use intent::{AccessMode, OpenFlags, OpenIntent};
pub use node::{FileNode, NodeSnapshot, SlotSnapshot};
pub use reconnect::ReconnectState;
pub use rpc::SmbRpc;
pub use share::SmbShare;
pub use slot::SlotKind;
