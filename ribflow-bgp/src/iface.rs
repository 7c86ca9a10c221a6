//! External collaborator interfaces.
//!
//! The core is a coordination layer: sessions, route storage and walk
//! infrastructure live outside it and are consumed through the traits here.
//! Handles (`PeerRef`, `TableRef`, `RouteRef`) are cloneable `Arc`s whose
//! identity (Eq/Hash) is the address of the underlying object, replacing the
//! raw-pointer webs of classical implementations.
//!
//! Trait methods are called from specific logical tasks (see [`crate::tasks`])
//! and must not call back into the membership API; `send_ready`/`send_update`
//! must be non-blocking.

use bytes::Bytes;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use crate::attr::Attr;
use crate::policy::RibExportPolicy;
use crate::ribout::RibOut;
use crate::sender::UpdateSender;

/// A typed route advertisement handed to `Peer::send_update`.
///
/// Encoding to the session's wire format happens downstream; the core only
/// depends on the enqueued-or-blocked contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    pub route_key: Bytes,
    pub attr: Arc<Attr>,
}

/// A peer session, as seen by the update pipeline.
pub trait Peer: Send + Sync {
    fn name(&self) -> &str;

    /// Session is established and may receive membership callbacks.
    fn is_ready(&self) -> bool;

    /// Socket is writable right now. Non-blocking.
    fn send_ready(&self) -> bool;

    /// Queue one update. Returns false if the socket blocked; the update
    /// stays queued in the core and is retried after `peer_send_ready`.
    fn send_update(&self, update: &UpdateMessage) -> bool;

    fn is_xmpp(&self) -> bool;

    /// A requested membership transition has been applied end-to-end.
    fn membership_request_callback(&self, table: &TableRef);

    /// Per-path callback during a RibIn walk. Returns true if the route
    /// needs re-notification.
    fn membership_path_callback(&self, partition: usize, route: &RouteRef, path: &RoutePath)
        -> bool;

    /// Peer is parked in graceful-restart timer wait.
    fn in_gr_timer_wait(&self) -> bool {
        false
    }
}

/// Per-route walk callback; runs on the `table-partition` task.
pub type EntryWalkFn = Arc<dyn Fn(usize, &RouteRef) + Send + Sync>;

/// Walk-done callback; runs on the `table-walker` task.
pub type DoneWalkFn = Arc<dyn Fn() + Send + Sync>;

/// Opaque token identifying an allocated table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WalkRef(u64);

impl WalkRef {
    #[must_use]
    pub const fn new(token: u64) -> Self {
        Self(token)
    }

    #[must_use]
    pub const fn token(self) -> u64 {
        self.0
    }
}

/// A routing table, as seen by the membership manager.
pub trait Table: Send + Sync {
    fn name(&self) -> &str;

    fn partition_count(&self) -> usize;

    /// Table is marked for deletion; membership operations against it are
    /// accepted as no-ops that still complete.
    fn is_deleted(&self) -> bool;

    /// VPN address family: extended communities stay on the wire.
    fn is_vpn(&self) -> bool;

    fn alloc_walker(&self, entry_cb: EntryWalkFn, done_cb: DoneWalkFn) -> WalkRef;

    fn walk_table(&self, walk: &WalkRef);

    fn release_walker(&self, walk: WalkRef);

    /// Find or create the ribout for `policy` on this table.
    fn ribout_locate(&self, sender: &Arc<UpdateSender>, policy: &RibExportPolicy) -> Arc<RibOut>;

    /// Re-run input post-processing for a route after RibIn walk callbacks.
    fn input_common_post_process(&self, partition: usize, route: &RouteRef, notify: bool);
}

/// One route in a table partition.
pub trait RouteEntry: Send + Sync {
    /// Stable key, also used as the update payload handle.
    fn key(&self) -> Bytes;

    fn best_path(&self) -> Option<RoutePath>;

    /// All paths, best first.
    fn paths(&self) -> Vec<RoutePath>;
}

/// Where a path was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSource {
    Local,
    Ibgp,
    Ebgp,
    Xmpp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathFlags {
    pub infeasible: bool,
    pub llgr_stale: bool,
    pub resolved: bool,
}

#[derive(Clone)]
pub struct RoutePath {
    pub peer: Option<PeerRef>,
    pub source: PathSource,
    pub flags: PathFlags,
    /// Replicated from another table; never exported or walked directly.
    pub secondary: bool,
    pub attr: Arc<Attr>,
}

macro_rules! address_identity_handle {
    ($name:ident, $trait:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone)]
        pub struct $name(Arc<dyn $trait>);

        impl $name {
            pub fn new<T: $trait + 'static>(inner: Arc<T>) -> Self {
                Self(inner)
            }

            #[must_use]
            pub fn from_dyn(inner: Arc<dyn $trait>) -> Self {
                Self(inner)
            }
        }

        impl Deref for $name {
            type Target = dyn $trait;

            fn deref(&self) -> &Self::Target {
                &*self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                // Data address only: coercing the same Arc at different
                // sites may produce distinct vtable pointers.
                std::ptr::eq(
                    Arc::as_ptr(&self.0) as *const u8,
                    Arc::as_ptr(&other.0) as *const u8,
                )
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                state.write_usize(Arc::as_ptr(&self.0) as *const u8 as usize);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0.name()).finish()
            }
        }
    };
}

address_identity_handle!(PeerRef, Peer, "Peer handle with identity by address.");
address_identity_handle!(TableRef, Table, "Table handle with identity by address.");

/// Route handle. Routes are not used as map keys, so plain cloning identity
/// is enough.
#[derive(Clone)]
pub struct RouteRef(Arc<dyn RouteEntry>);

impl RouteRef {
    pub fn new<R: RouteEntry + 'static>(inner: Arc<R>) -> Self {
        Self(inner)
    }
}

impl Deref for RouteRef {
    type Target = dyn RouteEntry;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for RouteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RouteRef").field(&self.key()).finish()
    }
}
