//! RibOut: the export side of a `(table, export-policy)` pair.
//!
//! A ribout owns a dense index space over its registered peers and one
//! [`UpdateQueues`] per table partition. Registration runs on the
//! `membership` task; queue draining runs on the per-partition
//! `send-update` task; enqueueing runs on `table-partition`. The peer table
//! sits under a `RwLock`, each partition's queues under their own `Mutex`,
//! and the peer lock is never acquired while a queue lock is held by the
//! same call path in the other order.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use ribflow_core::bitset::BitSet;
use ribflow_core::index_map::IndexedMap;
use ribflow_core::task;

use crate::config::CoreConfig;
use crate::export::export_route;
use crate::iface::{PeerRef, RouteRef, TableRef};
use crate::policy::RibExportPolicy;
use crate::sender::UpdateSender;
use crate::tasks;
use crate::update_queue::{UpdateQueues, QBULK, QUPDATE};

struct RegisteredPeer {
    peer: PeerRef,
}

#[derive(Default)]
struct RibOutPeers {
    imap: IndexedMap<PeerRef, RegisteredPeer>,
    /// Peers currently exporting; deactivated peers keep their index but
    /// leave this set.
    active: BitSet,
}

type Registry = DashMap<RibExportPolicy, Arc<RibOut>>;

pub struct RibOut {
    table: TableRef,
    policy: RibExportPolicy,
    config: Arc<CoreConfig>,
    sender: Arc<UpdateSender>,
    peers: RwLock<RibOutPeers>,
    updates: Vec<Mutex<UpdateQueues>>,
    listeners: AtomicUsize,
    registry: Weak<Registry>,
    self_ref: Weak<RibOut>,
}

impl RibOut {
    fn new(
        table: TableRef,
        policy: RibExportPolicy,
        sender: Arc<UpdateSender>,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        let config = sender.config().clone();
        debug_assert_eq!(table.partition_count(), config.partition_count);
        let updates = (0..config.partition_count)
            .map(|_| Mutex::new(UpdateQueues::new()))
            .collect();
        Arc::new_cyclic(|self_ref| Self {
            table,
            policy,
            config,
            sender,
            peers: RwLock::new(RibOutPeers::default()),
            updates,
            listeners: AtomicUsize::new(0),
            registry,
            self_ref: self_ref.clone(),
        })
    }

    /// This ribout as a map-key handle.
    #[must_use]
    pub fn handle(&self) -> RibOutRef {
        RibOutRef::new(self.self_ref.upgrade().expect("ribout alive"))
    }

    /// Register a peer: allocate its index, position it at the tail marker
    /// of every partition queue and join it to the update sender.
    pub fn register(&self, peer: &PeerRef) {
        task::check(&[tasks::MEMBERSHIP]);

        let index = {
            let mut peers = self.peers.write();
            let (index, _) = peers.imap.locate_with(peer, |_| RegisteredPeer {
                peer: peer.clone(),
            });
            peers.active.set(index);
            index
        };
        for partition in &self.updates {
            partition.lock().join(index);
        }
        debug!(
            "[RIBOUT] {} registered peer {} at index {}",
            self.table.name(),
            peer.name(),
            index
        );
        self.sender.join(&self.handle(), peer);
    }

    /// Stop exporting to the peer. Its index and queued state survive until
    /// leave processing completes and `unregister` runs.
    pub fn deactivate(&self, peer: &PeerRef) {
        task::check(&[tasks::MEMBERSHIP]);
        let mut peers = self.peers.write();
        let index = peers.imap.index_of(peer).expect("peer registered");
        peers.active.reset(index);
    }

    /// Remove the peer entirely. The last unregister releases the ribout
    /// from its registry.
    pub fn unregister(&self, peer: &PeerRef) {
        task::check(&[tasks::MEMBERSHIP]);

        let index = self
            .peers
            .read()
            .imap
            .index_of(peer)
            .expect("peer registered");
        for partition in &self.updates {
            partition.lock().leave(index);
        }
        self.sender.leave(&self.handle(), peer);

        let empty = {
            let mut peers = self.peers.write();
            peers.active.reset(index);
            peers.imap.remove(peer, index);
            peers.imap.is_empty()
        };
        debug!(
            "[RIBOUT] {} unregistered peer {}",
            self.table.name(),
            peer.name()
        );
        if empty {
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(&self.policy);
                debug!("[RIBOUT] {} released (no peers left)", self.table.name());
            }
        }
    }

    #[must_use]
    pub fn peer_index(&self, peer: &PeerRef) -> Option<usize> {
        self.peers.read().imap.index_of(peer)
    }

    #[must_use]
    pub fn peer_at(&self, index: usize) -> Option<PeerRef> {
        self.peers.read().imap.at(index).map(|p| p.peer.clone())
    }

    /// The active peer set (ribout index space).
    #[must_use]
    pub fn peer_set(&self) -> BitSet {
        self.peers.read().active.clone()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().imap.count()
    }

    /// Table listener registration is reference counted; the table side
    /// of the hookup is owned by the embedder.
    pub fn register_listener(&self) {
        self.listeners.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn policy(&self) -> &RibExportPolicy {
        &self.policy
    }

    #[must_use]
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    #[must_use]
    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.updates.len()
    }

    /// Total queued entries across partitions and queues.
    #[must_use]
    pub fn queue_depth(&self) -> u32 {
        self.updates
            .iter()
            .map(|partition| partition.lock().size() as u32)
            .sum()
    }

    #[must_use]
    pub fn bgp_export(&self) -> BgpExport<'_> {
        BgpExport { ribout: self }
    }

    fn enqueue_update(
        &self,
        partition: usize,
        queue_id: usize,
        route: &RouteRef,
        attr: Arc<crate::attr::Attr>,
        target: BitSet,
    ) {
        let was_idle = self
            .updates[partition]
            .lock()
            .queue_mut(queue_id)
            .enqueue(route.key(), attr, target);
        if was_idle {
            trace!(
                "[RIBOUT] {} partition {} queue {} went active",
                self.table.name(),
                partition,
                queue_id
            );
            self.sender
                .ribout_active(partition, &self.handle(), queue_id);
        }
    }

    /// Drain one partition queue toward the tail for `msync`.
    pub(crate) fn tail_dequeue(
        &self,
        partition: usize,
        queue_id: usize,
        msync: &BitSet,
        blocked: &mut BitSet,
        munsync: &mut BitSet,
    ) -> bool {
        task::check(&[tasks::SEND_UPDATE]);
        let peers = self.peers.read();
        let mut queues = self.updates[partition].lock();
        queues
            .queue_mut(queue_id)
            .tail_dequeue(msync, blocked, munsync, &mut |bit, message| {
                peers
                    .imap
                    .at(bit)
                    .is_some_and(|p| p.peer.send_update(message))
            })
    }

    /// Advance one peer's marker in one partition queue.
    pub(crate) fn peer_dequeue(
        &self,
        partition: usize,
        queue_id: usize,
        peer_bit: usize,
        blocked: &mut BitSet,
    ) -> bool {
        task::check(&[tasks::SEND_UPDATE]);
        let peers = self.peers.read();
        let mut queues = self.updates[partition].lock();
        queues
            .queue_mut(queue_id)
            .peer_dequeue(peer_bit, blocked, &mut |bit, message| {
                peers
                    .imap
                    .at(bit)
                    .is_some_and(|p| p.peer.send_update(message))
            })
    }
}

/// RibOut handle with identity by address, usable as a map key.
#[derive(Clone)]
pub struct RibOutRef(Arc<RibOut>);

impl RibOutRef {
    #[must_use]
    pub fn new(ribout: Arc<RibOut>) -> Self {
        Self(ribout)
    }
}

impl std::ops::Deref for RibOutRef {
    type Target = Arc<RibOut>;

    fn deref(&self) -> &Arc<RibOut> {
        &self.0
    }
}

impl PartialEq for RibOutRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for RibOutRef {}

impl std::hash::Hash for RibOutRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_usize(Arc::as_ptr(&self.0) as usize);
    }
}

impl std::fmt::Debug for RibOutRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RibOutRef")
            .field(&self.0.table.name())
            .finish()
    }
}

/// The export pipeline entry points, one route at a time.
pub struct BgpExport<'a> {
    ribout: &'a RibOut,
}

impl BgpExport<'_> {
    /// Route-change path: advertise to the full active peer set.
    pub fn export(&self, partition: usize, route: &RouteRef) -> bool {
        task::check(&[tasks::TABLE_PARTITION]);
        let peerset = self.ribout.peer_set();
        if peerset.none() {
            return false;
        }
        let Some(uinfo) = export_route(self.ribout, route, &peerset) else {
            return false;
        };
        self.ribout
            .enqueue_update(partition, QUPDATE, route, uinfo.attr, uinfo.target);
        true
    }

    /// Join-time sync: advertise one route to peers joining the ribout.
    pub fn join(&self, partition: usize, join_set: &BitSet, route: &RouteRef) -> bool {
        task::check(&[tasks::TABLE_PARTITION]);
        if join_set.none() {
            return false;
        }
        let mut set = join_set.clone();
        set.intersect_with(&self.ribout.peer_set());
        if set.none() {
            return false;
        }
        let Some(uinfo) = export_route(self.ribout, route, &set) else {
            return false;
        };
        self.ribout
            .enqueue_update(partition, QBULK, route, uinfo.attr, uinfo.target);
        true
    }

    /// Route refresh: re-advertise one route to an existing peer set.
    pub fn refresh(&self, partition: usize, set: &BitSet, route: &RouteRef) -> bool {
        task::check(&[tasks::TABLE_PARTITION]);
        if set.none() {
            return false;
        }
        let mut set = set.clone();
        set.intersect_with(&self.ribout.peer_set());
        if set.none() {
            return false;
        }
        let Some(uinfo) = export_route(self.ribout, route, &set) else {
            return false;
        };
        self.ribout
            .enqueue_update(partition, QUPDATE, route, uinfo.attr, uinfo.target);
        true
    }

    /// Leave processing: scrub the leaving peers' pending bits for one
    /// route.
    pub fn leave(&self, partition: usize, leave_set: &BitSet, route: &RouteRef) -> bool {
        task::check(&[tasks::TABLE_PARTITION]);
        if leave_set.none() {
            return false;
        }
        let mut queues = self.ribout.updates[partition].lock();
        let key = route.key();
        for queue_id in 0..crate::update_queue::QCOUNT {
            queues.queue_mut(queue_id).leave_route(&key, leave_set);
        }
        true
    }
}

/// Policy-keyed ribout registry for `Table` implementors.
///
/// `Table::ribout_locate` is expected to delegate here; ribouts release
/// themselves from the registry when their last peer unregisters.
#[derive(Clone, Default)]
pub struct RibOutMap {
    inner: Arc<Registry>,
}

impl RibOutMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locate(
        &self,
        table: &TableRef,
        sender: &Arc<UpdateSender>,
        policy: &RibExportPolicy,
    ) -> Arc<RibOut> {
        if let Some(existing) = self.inner.get(policy) {
            return existing.value().clone();
        }
        let ribout = RibOut::new(
            table.clone(),
            policy.clone(),
            sender.clone(),
            Arc::downgrade(&self.inner),
        );
        self.inner
            .entry(policy.clone())
            .or_insert(ribout)
            .value()
            .clone()
    }

    #[must_use]
    pub fn find(&self, policy: &RibExportPolicy) -> Option<Arc<RibOut>> {
        self.inner.get(policy).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
