//! RibOut export filter.
//!
//! Maps a route's best path to at most one per-ribout update. There is no
//! failure path here: every gate is a reject (no update emitted).
//!
//! The rules run in a fixed order: best-path gates, community gates, split
//! horizon, AS-path loop (with as-override substitution first), per-encoding
//! attribute rewrite, extended-community scrub, remove-private, next-hop
//! rewrite, and LLGR staleness handling last.

use std::sync::Arc;
use tracing::trace;

use ribflow_core::bitset::BitSet;

use crate::attr::{community, Attr, AsPath, DEFAULT_LOCAL_PREF};
use crate::iface::{PathSource, RouteRef};
use crate::policy::{Encoding, PeerType};
use crate::ribout::RibOut;

/// One computed update: the target peers (ribout peer indices) and the
/// attributes to advertise to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub target: BitSet,
    pub attr: Arc<Attr>,
}

/// Run the export filter for `route` against `peerset`.
pub(crate) fn export_route(
    ribout: &RibOut,
    route: &RouteRef,
    peerset: &BitSet,
) -> Option<UpdateInfo> {
    let path = route.best_path()?;
    if path.flags.infeasible || path.secondary {
        return None;
    }

    let policy = ribout.policy();
    let attr_in = path.attr.clone();

    // Community gates. XMPP ribouts ignore all of them.
    if policy.encoding != Encoding::Xmpp {
        if attr_in.has_community(community::NO_ADVERTISE) {
            trace!("[EXPORT] {:?} rejected: no-advertise", route);
            return None;
        }
        if policy.peer_type == PeerType::Ebgp
            && (attr_in.has_community(community::NO_EXPORT)
                || attr_in.has_community(community::NO_EXPORT_SUBCONFED))
        {
            trace!("[EXPORT] {:?} rejected: no-export", route);
            return None;
        }
    }

    let mut target = peerset.clone();

    // Split horizon.
    match policy.peer_type {
        PeerType::Ibgp => {
            if path.source == PathSource::Ibgp {
                return None;
            }
        }
        PeerType::Ebgp => {
            if let Some(source) = &path.peer {
                if let Some(index) = ribout.peer_index(source) {
                    target.reset(index);
                }
            }
        }
        PeerType::Xmpp => {}
    }
    if target.none() {
        return None;
    }

    let stale = path.flags.llgr_stale || attr_in.has_community(community::LLGR_STALE);

    if policy.encoding == Encoding::Xmpp {
        // Attributes pass through unchanged, save for staleness marking.
        if !stale {
            return Some(UpdateInfo {
                target,
                attr: attr_in,
            });
        }
        let mut attr = (*attr_in).clone();
        apply_llgr(&mut attr, policy.llgr);
        return Some(UpdateInfo {
            target,
            attr: Arc::new(attr),
        });
    }

    let mut attr = (*attr_in).clone();
    let local_as = ribout.config().local_as();

    // AS-path loop, with as-override substituting the peer AS first.
    if policy.as_override {
        if let Some(as_path) = &mut attr.as_path {
            as_path.replace_as(policy.as_number, local_as);
        }
    }
    if let Some(as_path) = &attr.as_path {
        if as_path.contains(policy.as_number) {
            trace!("[EXPORT] {:?} rejected: as-path loop of {}", route, policy.as_number);
            return None;
        }
    }

    match policy.peer_type {
        PeerType::Ebgp => {
            // Med survives only when the source was effectively internal.
            let retain_med = attr.as_path.as_ref().map_or(true, AsPath::is_empty);
            attr.local_pref = 0;
            attr.as_path
                .get_or_insert_with(AsPath::new)
                .prepend(local_as);
            if !retain_med {
                attr.med = 0;
            }
            attr.originator_id = None;
            attr.cluster_list.clear();
        }
        PeerType::Ibgp => {
            if attr.local_pref == 0 {
                attr.local_pref = DEFAULT_LOCAL_PREF;
            }
        }
        PeerType::Xmpp => {}
    }

    // Families that do not carry extended communities on the wire.
    if !ribout.table().is_vpn() {
        attr.ext_communities.clear();
    }

    if policy.remove_private.enabled {
        if let Some(as_path) = &attr.as_path {
            let avoid = policy
                .remove_private
                .peer_loop_check
                .then_some(policy.as_number);
            attr.as_path = Some(as_path.remove_private(
                policy.remove_private.all,
                policy.remove_private.replace,
                local_as,
                avoid,
            ));
        }
    }

    if let Some(nexthop) = policy.nexthop {
        attr.next_hop = nexthop;
    }

    if stale {
        apply_llgr(&mut attr, policy.llgr);
    }

    Some(UpdateInfo {
        target,
        attr: Arc::new(attr),
    })
}

/// Stale-path marking: LLGR-capable peers get the stale community, others
/// get no-export with zero preference so the route cannot win or spread.
fn apply_llgr(attr: &mut Attr, llgr_capable: bool) {
    if llgr_capable {
        attr.add_community(community::LLGR_STALE);
    } else {
        attr.add_community(community::NO_EXPORT);
        attr.local_pref = 0;
    }
}
