//! Seam to the cluster RPC layer.
//!
//! The coordinator only needs "execute this command on peer X and give me
//! the raw answer". Delivery semantics (at-least-once, request/response)
//! belong to the implementation behind this trait.

use extsync_core::{ManagementServerHost, SyncCommand};

use crate::error::ClusterError;

#[cfg_attr(test, mockall::automock)]
pub trait ClusterTransport: Send + Sync {
    /// Run `command` on `peer` and return its serialized answer list.
    ///
    /// The answer is a JSON array of `{ "result": bool, "details": string }`;
    /// the first entry is authoritative.
    fn execute(
        &self,
        peer: &ManagementServerHost,
        command: &SyncCommand,
    ) -> Result<String, ClusterError>;
}
