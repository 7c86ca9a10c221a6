//! Per-RibOut export policy.
//!
//! A `RibExportPolicy` is the identity of a `RibOut` within its table: peers
//! sharing a policy share the ribout, its queues and its encoded updates.

use std::net::IpAddr;

use crate::attr::AsNumber;

/// The kind of peering a ribout serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerType {
    Ibgp,
    Ebgp,
    Xmpp,
}

/// Wire encoding family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Bgp,
    Xmpp,
}

/// Remove-private-AS configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RemovePrivatePolicy {
    pub enabled: bool,
    /// Remove every private AS, not just the leading run.
    pub all: bool,
    /// Substitute instead of delete.
    pub replace: bool,
    /// Re-check the peer AS for loops after substitution.
    pub peer_loop_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RibExportPolicy {
    pub peer_type: PeerType,
    pub encoding: Encoding,
    /// Remote AS of the peers in this ribout; the loop-check and
    /// as-override target.
    pub as_number: AsNumber,
    pub as_override: bool,
    /// Rewrite the next hop to this address on export.
    pub nexthop: Option<IpAddr>,
    /// Peers of this ribout negotiated long-lived graceful restart.
    pub llgr: bool,
    pub remove_private: RemovePrivatePolicy,
}

impl RibExportPolicy {
    #[must_use]
    pub fn new(peer_type: PeerType, encoding: Encoding, as_number: AsNumber) -> Self {
        Self {
            peer_type,
            encoding,
            as_number,
            as_override: false,
            nexthop: None,
            llgr: false,
            remove_private: RemovePrivatePolicy::default(),
        }
    }

    /// Policy for XMPP agents: attributes pass through untouched.
    #[must_use]
    pub fn xmpp() -> Self {
        Self::new(PeerType::Xmpp, Encoding::Xmpp, 0)
    }

    #[must_use]
    pub fn with_as_override(mut self) -> Self {
        self.as_override = true;
        self
    }

    #[must_use]
    pub fn with_nexthop(mut self, nexthop: IpAddr) -> Self {
        self.nexthop = Some(nexthop);
        self
    }

    #[must_use]
    pub fn with_llgr(mut self) -> Self {
        self.llgr = true;
        self
    }

    #[must_use]
    pub fn with_remove_private(mut self, all: bool, replace: bool, peer_loop_check: bool) -> Self {
        self.remove_private = RemovePrivatePolicy {
            enabled: true,
            all,
            replace,
            peer_loop_check,
        };
        self
    }
}
