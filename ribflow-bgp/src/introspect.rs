//! Introspect payloads.
//!
//! Read-only snapshots of membership and sender state, serializable for
//! whatever introspection transport the embedder runs. Field names are part
//! of the contract.

use serde::Serialize;

/// One table a peer is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingTableInfo {
    pub name: String,
    pub current_state: String,
}

/// Per-peer membership summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerMembershipInfo {
    /// "in sync", "not in sync" or "not advertising".
    pub send_state: String,
    pub routing_tables: Vec<RoutingTableInfo>,
}

/// One peer's registration state within a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipPeerInfo {
    pub peer: String,
    pub ribin_registered: bool,
    pub ribout_registered: bool,
    pub instance_id: i32,
    pub generation_id: u64,
}

/// Per-table membership summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableMembershipInfo {
    pub requests: u32,
    pub walks: u32,
    pub peers: Vec<MembershipPeerInfo>,
}
