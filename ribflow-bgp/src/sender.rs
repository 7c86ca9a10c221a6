//! The update sender: per-partition schedulers plus a thin aggregate.
//!
//! Each [`SenderPartition`] keeps its own view of which peers are blocked
//! or in sync and drains a FIFO of work items:
//!
//! - `Work::RibOut`: tail dequeue for a `(ribout, queue)` that went active.
//! - `Work::Peer`: resume a peer that became send-ready again.
//!
//! Partition state is mutated from exactly two tasks: `membership`
//! (add/remove) and the partition's own `send-update` worker; a single
//! mutex serializes them. The work FIFO has its own mutex so producers on
//! other tasks can enqueue without touching partition state; cancelled
//! items are tombstoned in place, never removed (FIFO positions may have
//! been observed). Lock order within a partition is state before FIFO.
//!
//! A peer's cached `send_ready` is the one field read across tasks and may
//! lag the socket (the peer can block in another partition); the peer's
//! own `send_ready()` is authoritative.
//!
//! The aggregate [`UpdateSender`] fans membership joins and leaves to
//! every partition, routes `ribout_active` to one, and funnels send-ready
//! notifications through a dedicated `send-ready` queue. That queue is
//! what prevents lost wakeups when a peer unblocks while a partition is
//! still mid-block on it.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use ribflow_core::bitset::BitSet;
use ribflow_core::error::Result;
use ribflow_core::index_map::IndexedMap;
use ribflow_core::task::{self, TaskScope};
use ribflow_core::work_queue::WorkQueue;

use crate::config::CoreConfig;
use crate::iface::PeerRef;
use crate::ribout::RibOutRef;
use crate::tasks;
use crate::update_queue::QCOUNT;

enum Work {
    RibOut { ribout: RibOutRef, queue_id: usize },
    Peer { peer: PeerRef },
}

/// Per-peer sender state within one partition.
struct PeerEntry {
    peer: PeerRef,
    /// Partition rib index -> active-queue mask.
    rib_set: BTreeMap<usize, u8>,
    rib_bitset: BitSet,
    qactive_cnt: [usize; QCOUNT],
    /// Peer sits at the tail marker of every queue it is joined to.
    in_sync: bool,
    /// Cached socket writability; may lag `peer.send_ready()`.
    send_ready: AtomicBool,
    /// Resume hint for the circular rib walk after an unblock.
    rib_iterator: usize,
}

impl PeerEntry {
    fn new(peer: PeerRef) -> Self {
        Self {
            peer,
            rib_set: BTreeMap::new(),
            rib_bitset: BitSet::new(),
            qactive_cnt: [0; QCOUNT],
            in_sync: true,
            send_ready: AtomicBool::new(true),
            rib_iterator: 0,
        }
    }

    fn add_rib(&mut self, rib_index: usize) {
        self.rib_set.insert(rib_index, 0);
        self.rib_bitset.set(rib_index);
    }

    fn remove_rib(&mut self, rib_index: usize) {
        for queue_id in 0..QCOUNT {
            self.set_queue_inactive(rib_index, queue_id);
        }
        self.rib_set.remove(&rib_index);
        self.rib_bitset.reset(rib_index);
    }

    fn set_queue_active(&mut self, rib_index: usize, queue_id: usize) {
        let mask = self.rib_set.get_mut(&rib_index).expect("rib joined");
        if *mask & (1 << queue_id) == 0 {
            *mask |= 1 << queue_id;
            self.qactive_cnt[queue_id] += 1;
        }
    }

    fn set_queue_inactive(&mut self, rib_index: usize, queue_id: usize) {
        let Some(mask) = self.rib_set.get_mut(&rib_index) else {
            return;
        };
        if *mask & (1 << queue_id) != 0 {
            *mask &= !(1 << queue_id);
            self.qactive_cnt[queue_id] -= 1;
        }
    }

    fn is_queue_active(&self, rib_index: usize, queue_id: usize) -> bool {
        self.rib_set
            .get(&rib_index)
            .is_some_and(|mask| mask & (1 << queue_id) != 0)
    }

    fn set_sync(&mut self) {
        debug_assert!(self.rib_set.values().all(|mask| *mask == 0));
        debug_assert!(self.qactive_cnt.iter().all(|count| *count == 0));
        self.in_sync = true;
    }

    fn send_ready(&self) -> bool {
        self.send_ready.load(Ordering::Relaxed)
    }

    fn set_send_ready(&self, ready: bool) {
        self.send_ready.store(ready, Ordering::Relaxed);
    }

    /// Rib indices in circular order starting at the resume hint.
    fn circular_rib_indices(&self) -> Vec<usize> {
        let mut order: Vec<usize> = self.rib_set.range(self.rib_iterator..).map(|(i, _)| *i).collect();
        order.extend(self.rib_set.range(..self.rib_iterator).map(|(i, _)| *i));
        order
    }

    fn check_invariants(&self) -> bool {
        for queue_id in 0..QCOUNT {
            let mask_count = self
                .rib_set
                .values()
                .filter(|mask| **mask & (1 << queue_id) != 0)
                .count();
            if mask_count != self.qactive_cnt[queue_id] {
                return false;
            }
            if self.qactive_cnt[queue_id] > self.rib_set.len() {
                return false;
            }
            if self.in_sync && self.qactive_cnt[queue_id] != 0 {
                return false;
            }
        }
        true
    }
}

/// Per-ribout sender state within one partition.
struct RibEntry {
    ribout: RibOutRef,
    /// Partition peer indices advertising this ribout.
    peer_set: BitSet,
    in_sync: [bool; QCOUNT],
}

impl RibEntry {
    fn new(ribout: RibOutRef) -> Self {
        Self {
            ribout,
            peer_set: BitSet::new(),
            in_sync: [true; QCOUNT],
        }
    }
}

struct PartitionState {
    peer_imap: IndexedMap<PeerRef, PeerEntry>,
    rib_imap: IndexedMap<RibOutRef, RibEntry>,
}

impl PartitionState {
    fn new() -> Self {
        Self {
            peer_imap: IndexedMap::new(),
            rib_imap: IndexedMap::new(),
        }
    }
}

/// One partition's scheduler.
pub struct SenderPartition {
    index: usize,
    state: Mutex<PartitionState>,
    queue: Mutex<WorkQueue<Work>>,
    disabled: AtomicBool,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
}

impl SenderPartition {
    fn new(index: usize) -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            index,
            state: Mutex::new(PartitionState::new()),
            queue: Mutex::new(WorkQueue::new()),
            disabled: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Wire up the `(ribout, peer)` combo in this partition.
    fn add(&self, ribout: &RibOutRef, peer: &PeerRef) {
        task::check(&[tasks::MEMBERSHIP]);
        let mut state = self.state.lock();
        let (rib_index, _) = state
            .rib_imap
            .locate_with(ribout, |_| RibEntry::new(ribout.clone()));
        let (peer_index, ps) = state
            .peer_imap
            .locate_with(peer, |_| PeerEntry::new(peer.clone()));
        ps.add_rib(rib_index);
        state
            .rib_imap
            .at_mut(rib_index)
            .expect("rib entry just located")
            .peer_set
            .set(peer_index);
    }

    /// Decouple the combo and drop empty entries, tombstoning any queued
    /// work that refers to them.
    fn remove(&self, ribout: &RibOutRef, peer: &PeerRef) {
        task::check(&[tasks::MEMBERSHIP]);
        let mut state = self.state.lock();
        let rib_index = state.rib_imap.index_of(ribout).expect("ribout added");
        let peer_index = state.peer_imap.index_of(peer).expect("peer added");

        let rib_empty = {
            let rs = state.rib_imap.at_mut(rib_index).expect("rib entry");
            rs.peer_set.reset(peer_index);
            rs.peer_set.none()
        };
        let peer_empty = {
            let ps = state.peer_imap.at_mut(peer_index).expect("peer entry");
            ps.remove_rib(rib_index);
            ps.rib_set.is_empty()
        };

        if rib_empty {
            self.queue.lock().invalidate_matching(|work| {
                matches!(work, Work::RibOut { ribout: r, .. } if r == ribout)
            });
            state.rib_imap.remove(ribout, rib_index);
        }
        if peer_empty {
            self.queue.lock().invalidate_matching(|work| {
                matches!(work, Work::Peer { peer: p } if p == peer)
            });
            state.peer_imap.remove(peer, peer_index);
        }
    }

    fn ribout_active(&self, ribout: &RibOutRef, queue_id: usize) {
        task::check(&[
            tasks::TABLE_PARTITION,
            tasks::SEND_UPDATE,
            tasks::MEMBERSHIP,
        ]);
        self.queue.lock().push(Work::RibOut {
            ribout: ribout.clone(),
            queue_id,
        });
        self.wake();
    }

    /// Mark a peer send-ready and schedule its resume.
    fn peer_send_ready(&self, peer: &PeerRef) {
        task::check(&[tasks::SEND_READY]);
        let state = self.state.lock();
        // The peer may never have registered, or may already be gone.
        let Some(ps) = state.peer_imap.find(peer) else {
            return;
        };
        if ps.send_ready() {
            return;
        }
        ps.set_send_ready(true);
        drop(state);
        self.queue.lock().push(Work::Peer { peer: peer.clone() });
        self.wake();
    }

    fn peer_is_registered(&self, peer: &PeerRef) -> bool {
        task::check(&[tasks::MEMBERSHIP, tasks::SHOW]);
        self.state.lock().peer_imap.find(peer).is_some()
    }

    fn peer_in_sync(&self, peer: &PeerRef) -> bool {
        task::check(&[tasks::MEMBERSHIP, tasks::SHOW]);
        self.state
            .lock()
            .peer_imap
            .find(peer)
            .is_some_and(|ps| ps.in_sync)
    }

    fn peer_is_send_ready(&self, peer: &PeerRef) -> bool {
        task::check(&[tasks::MEMBERSHIP, tasks::SHOW]);
        self.state
            .lock()
            .peer_imap
            .find(peer)
            .is_some_and(PeerEntry::send_ready)
    }

    /// Drain the work FIFO. Runs on this partition's `send-update` task.
    pub fn process(&self) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let _scope = TaskScope::enter(tasks::SEND_UPDATE);
        loop {
            let work = self.queue.lock().pop();
            let Some(work) = work else {
                break;
            };
            match work {
                Work::RibOut { ribout, queue_id } => self.update_ribout(&ribout, queue_id),
                Work::Peer { peer } => self.update_peer(&peer),
            }
        }
    }

    /// Tail dequeue: drain the queue until empty or all in-sync members
    /// blocked.
    fn update_ribout(&self, ribout: &RibOutRef, queue_id: usize) {
        let mut state = self.state.lock();
        let Some(rib_index) = state.rib_imap.index_of(ribout) else {
            return;
        };

        // In-sync members, converted to ribout index space. A peer whose
        // socket went non-writable in another partition is caught here.
        let mut msync = BitSet::new();
        let members = state.rib_imap.at(rib_index).expect("rib entry").peer_set.clone();
        for peer_index in members.ones() {
            let ps = state.peer_imap.at_mut(peer_index).expect("member peer");
            if !ps.in_sync {
                continue;
            }
            if ps.peer.send_ready() {
                if let Some(bit) = ribout.peer_index(&ps.peer) {
                    msync.set(bit);
                }
            } else {
                ps.in_sync = false;
                ps.set_send_ready(false);
            }
        }

        let mut blocked = BitSet::new();
        let mut munsync = BitSet::new();
        let done = ribout.tail_dequeue(self.index, queue_id, &msync, &mut blocked, &mut munsync);
        debug_assert!(msync.contains(&blocked));

        self.apply_blocked(&mut state, ribout, rib_index, queue_id, &blocked);

        // Unsync peers were split from the tail marker; without this their
        // (ribout, queue) would never be marked active again.
        for bit in munsync.ones() {
            if let Some(peer) = ribout.peer_at(bit) {
                if let Some(ps) = state.peer_imap.find_mut(&peer) {
                    ps.set_queue_active(rib_index, queue_id);
                }
            }
        }

        if !done {
            trace!(
                "[SENDER:{}] ribout queue {} unsync, waiting for a peer to sync",
                self.index,
                queue_id
            );
            state
                .rib_imap
                .at_mut(rib_index)
                .expect("rib entry")
                .in_sync[queue_id] = false;
        }
    }

    /// Peer dequeue: drain every active queue for the peer, or stop at the
    /// first block and remember where to resume.
    fn update_peer(&self, peer: &PeerRef) {
        let mut state = self.state.lock();
        let Some(peer_index) = state.peer_imap.index_of(peer) else {
            return;
        };
        {
            let ps = state.peer_imap.at(peer_index).expect("peer entry");
            if !ps.send_ready() {
                return;
            }
            // Blocked in another partition since the notification.
            if !peer.send_ready() {
                ps.set_send_ready(false);
                return;
            }
        }

        for queue_id in (0..QCOUNT).rev() {
            if state.peer_imap.at(peer_index).expect("peer entry").qactive_cnt[queue_id] == 0 {
                continue;
            }
            if !self.update_peer_queue(&mut state, peer, peer_index, queue_id) {
                debug_assert!(!state.peer_imap.at(peer_index).expect("peer entry").send_ready());
                return;
            }
        }

        // The per-queue return values only say that *some* peer merged
        // with the tail marker; the peer itself must still be writable.
        if !state.peer_imap.at(peer_index).expect("peer entry").send_ready() {
            return;
        }
        state
            .peer_imap
            .at_mut(peer_index)
            .expect("peer entry")
            .set_sync();
        trace!("[SENDER:{}] peer {} back in sync", self.index, peer.name());

        for queue_id in (0..QCOUNT).rev() {
            self.mark_queues_sync(&mut state, peer_index, queue_id);
        }
    }

    /// Walk the peer's ribs circularly from the resume hint, draining one
    /// queue. Returns false if the peer blocked.
    fn update_peer_queue(
        &self,
        state: &mut PartitionState,
        peer: &PeerRef,
        peer_index: usize,
        queue_id: usize,
    ) -> bool {
        let order = state
            .peer_imap
            .at(peer_index)
            .expect("peer entry")
            .circular_rib_indices();
        for rib_index in order {
            if !state
                .peer_imap
                .at(peer_index)
                .expect("peer entry")
                .is_queue_active(rib_index, queue_id)
            {
                continue;
            }
            let ribout = state
                .rib_imap
                .at(rib_index)
                .expect("active rib entry")
                .ribout
                .clone();
            let Some(peer_bit) = ribout.peer_index(peer) else {
                continue;
            };

            let mut blocked = BitSet::new();
            let done = ribout.peer_dequeue(self.index, queue_id, peer_bit, &mut blocked);
            self.apply_blocked(state, &ribout, rib_index, queue_id, &blocked);

            let ps = state.peer_imap.at_mut(peer_index).expect("peer entry");
            if ps.send_ready() {
                debug_assert!(done);
                ps.set_queue_inactive(rib_index, queue_id);
            } else {
                // Remember where to pick up; merged peers that blocked
                // with us resume via their own work items.
                ps.rib_iterator = rib_index;
                return false;
            }
        }
        true
    }

    /// Blocked peers (ribout index space): queue goes active, sync and
    /// cached writability are cleared.
    fn apply_blocked(
        &self,
        state: &mut PartitionState,
        ribout: &RibOutRef,
        rib_index: usize,
        queue_id: usize,
        blocked: &BitSet,
    ) {
        for bit in blocked.ones() {
            let Some(peer) = ribout.peer_at(bit) else {
                continue;
            };
            let Some(ps) = state.peer_imap.find_mut(&peer) else {
                continue;
            };
            ps.set_queue_active(rib_index, queue_id);
            ps.in_sync = false;
            ps.set_send_ready(false);
        }
    }

    /// The peer is back in sync: rearm tail dequeues for any of its ribs
    /// whose queue went unsync while everyone was blocked.
    fn mark_queues_sync(&self, state: &mut PartitionState, peer_index: usize, queue_id: usize) {
        let ribs: Vec<usize> = state
            .peer_imap
            .at(peer_index)
            .expect("peer entry")
            .rib_set
            .keys()
            .copied()
            .collect();
        for rib_index in ribs {
            let rs = state.rib_imap.at_mut(rib_index).expect("rib entry");
            if !rs.in_sync[queue_id] {
                let ribout = rs.ribout.clone();
                rs.in_sync[queue_id] = true;
                self.queue.lock().push(Work::RibOut {
                    ribout,
                    queue_id,
                });
                self.wake();
            }
        }
    }

    fn check_invariants(&self) -> bool {
        let state = self.state.lock();
        let mut rib_peer_edges = 0;
        let mut peer_rib_edges = 0;
        for rib_index in state.rib_imap.bits().ones() {
            let Some(rs) = state.rib_imap.at(rib_index) else {
                return false;
            };
            for peer_index in rs.peer_set.ones() {
                let Some(ps) = state.peer_imap.at(peer_index) else {
                    return false;
                };
                if !ps.rib_bitset.test(rib_index) {
                    return false;
                }
                rib_peer_edges += 1;
            }
        }
        for peer_index in state.peer_imap.bits().ones() {
            let Some(ps) = state.peer_imap.at(peer_index) else {
                return false;
            };
            if !ps.check_invariants() {
                return false;
            }
            for rib_index in ps.rib_bitset.ones() {
                let Some(rs) = state.rib_imap.at(rib_index) else {
                    return false;
                };
                if !rs.peer_set.test(peer_index) {
                    return false;
                }
                peer_rib_edges += 1;
            }
        }
        rib_peer_edges == peer_rib_edges
    }

    fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
        if !disabled {
            self.wake();
        }
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

/// Aggregate over all partitions.
pub struct UpdateSender {
    config: Arc<CoreConfig>,
    partitions: Vec<SenderPartition>,
    send_ready_tx: flume::Sender<PeerRef>,
    send_ready_rx: flume::Receiver<PeerRef>,
}

impl UpdateSender {
    pub fn new(config: CoreConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (send_ready_tx, send_ready_rx) = flume::unbounded();
        let partitions = (0..config.partition_count).map(SenderPartition::new).collect();
        Ok(Arc::new(Self {
            config: Arc::new(config),
            partitions,
            send_ready_tx,
            send_ready_rx,
        }))
    }

    #[must_use]
    pub fn config(&self) -> &Arc<CoreConfig> {
        &self.config
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Join a peer to a ribout in every partition.
    pub fn join(&self, ribout: &RibOutRef, peer: &PeerRef) {
        task::check(&[tasks::MEMBERSHIP]);
        for partition in &self.partitions {
            partition.add(ribout, peer);
        }
    }

    /// Leave a peer from a ribout in every partition.
    pub fn leave(&self, ribout: &RibOutRef, peer: &PeerRef) {
        task::check(&[tasks::MEMBERSHIP]);
        for partition in &self.partitions {
            partition.remove(ribout, peer);
        }
    }

    /// A `(ribout, queue)` in one partition has pending work.
    pub fn ribout_active(&self, partition: usize, ribout: &RibOutRef, queue_id: usize) {
        self.partitions[partition].ribout_active(ribout, queue_id);
    }

    /// Note a peer's socket became writable. Callable from any task; the
    /// notification is processed on the `send-ready` task.
    pub fn peer_send_ready(&self, peer: &PeerRef) {
        let _ = self.send_ready_tx.send(peer.clone());
    }

    /// Drain pending send-ready notifications, fanning each to every
    /// partition.
    pub fn process_send_ready(&self) {
        let _scope = TaskScope::enter(tasks::SEND_READY);
        while let Ok(peer) = self.send_ready_rx.try_recv() {
            debug!("[SENDER] peer {} send-ready", peer.name());
            for partition in &self.partitions {
                partition.peer_send_ready(&peer);
            }
        }
    }

    /// Drain one partition's work FIFO.
    pub fn process_partition(&self, index: usize) {
        self.partitions[index].process();
    }

    /// Drain every partition; test and single-threaded embedder
    /// convenience.
    pub fn process_partitions(&self) {
        for partition in &self.partitions {
            partition.process();
        }
    }

    #[must_use]
    pub fn peer_is_registered(&self, peer: &PeerRef) -> bool {
        self.partitions.iter().any(|p| p.peer_is_registered(peer))
    }

    #[must_use]
    pub fn peer_in_sync(&self, peer: &PeerRef) -> bool {
        self.partitions.iter().all(|p| p.peer_in_sync(peer))
    }

    #[must_use]
    pub fn peer_is_send_ready(&self, peer: &PeerRef) -> bool {
        self.partitions.iter().all(|p| p.peer_is_send_ready(peer))
    }

    #[must_use]
    pub fn check_invariants(&self) -> bool {
        self.partitions.iter().all(SenderPartition::check_invariants)
    }

    /// Stop the workers from draining; work accumulates. Testing hook.
    pub fn disable_processing(&self) {
        for partition in &self.partitions {
            partition.set_disabled(true);
        }
    }

    pub fn enable_processing(&self) {
        for partition in &self.partitions {
            partition.set_disabled(false);
        }
    }

    /// Run one partition's worker until the sender is dropped. Spawn one
    /// of these per partition on the embedding runtime.
    pub async fn run_partition(&self, index: usize) {
        let partition = &self.partitions[index];
        while partition.wake_rx.recv_async().await.is_ok() {
            partition.process();
        }
    }

    /// Run the send-ready fan-out until the sender is dropped.
    pub async fn run_send_ready(&self) {
        while let Ok(peer) = self.send_ready_rx.recv_async().await {
            self.dispatch_send_ready(&peer);
        }
    }

    fn dispatch_send_ready(&self, peer: &PeerRef) {
        let _scope = TaskScope::enter(tasks::SEND_READY);
        debug!("[SENDER] peer {} send-ready", peer.name());
        for partition in &self.partitions {
            partition.peer_send_ready(peer);
        }
    }
}
