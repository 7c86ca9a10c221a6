//! Peer/RIB membership manager.
//!
//! Reconciles `(peer, table)` subscription lifecycle with table walks and
//! ribout registration. All mutation happens on the `membership` task by
//! draining an event queue; API entry points run on control tasks, set up
//! the requested transition under the writer lock and post an event.
//! Read-only inspection from other tasks takes the reader side.
//!
//! A `(peer, table)` edge carries at most one in-flight action:
//!
//! - `RibOutAdd`: create/locate the ribout, register the peer, then walk
//!   the table to sync it (join processing).
//! - `RibInDelete` / `RibInWalk`: RibIn-only teardown or sweep; the walk
//!   runs per-path callbacks on the source peer.
//! - `RibInWalkRibOutDelete` / `RibInDeleteRibOutDelete`: unregister
//!   variants; the walk applies leave processing before the ribout entry
//!   is released.
//!
//! The walker serializes everything: it walks one table at a time,
//! batching every pending edge of that table into a single walk. Requests
//! that arrive during a walk accumulate for the next batch. The walk
//! callbacks run on the table infrastructure's tasks and only read the
//! walk's frozen context; completion is funneled back here as an event.

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use hashbrown::{HashMap, HashSet};
use ribflow_core::bitset::BitSet;
use ribflow_core::task::{self, TaskScope};

use crate::config::CoreConfig;
use crate::iface::{DoneWalkFn, EntryWalkFn, PeerRef, TableRef, WalkRef};
use crate::introspect::{
    MembershipPeerInfo, PeerMembershipInfo, RoutingTableInfo, TableMembershipInfo,
};
use crate::policy::RibExportPolicy;
use crate::ribout::RibOut;
use crate::sender::UpdateSender;
use crate::tasks;

/// The in-flight transition of one `(peer, table)` edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    RibOutAdd,
    RibInDelete,
    RibInWalk,
    RibInWalkRibOutDelete,
    RibInDeleteRibOutDelete,
}

/// Callback invoked (for XMPP peers only) when a registration completes;
/// the bool is true on unregister.
pub type PeerRegistrationCallback = Arc<dyn Fn(&PeerRef, &TableRef, bool) + Send + Sync>;

enum Event {
    RegisterRib {
        peer: PeerRef,
        table: TableRef,
        policy: RibExportPolicy,
        instance_id: i32,
    },
    RegisterRibComplete {
        peer: PeerRef,
        table: TableRef,
    },
    UnregisterRib {
        peer: PeerRef,
        table: TableRef,
    },
    UnregisterRibComplete {
        peer: PeerRef,
        table: TableRef,
    },
    WalkRibComplete {
        peer: PeerRef,
        table: TableRef,
    },
    WalkDone {
        table: TableRef,
    },
    WalkTrigger,
}

enum Deferred {
    RequestCallback {
        peer: PeerRef,
        table: TableRef,
    },
    RegistrationNotify {
        peer: PeerRef,
        table: TableRef,
        unregister: bool,
    },
}

/// The `(peer, table)` edge.
struct PeerRibState {
    ribin_registered: bool,
    ribout_registered: bool,
    ribout: Option<Arc<RibOut>>,
    ribout_index: Option<usize>,
    action: Action,
    instance_id: i32,
    subscription_gen_id: u64,
    /// An in-flight register was overtaken by an unregister; its
    /// completion callback fires when the unregister event is processed.
    register_absorbed: bool,
}

impl PeerRibState {
    fn new() -> Self {
        Self {
            ribin_registered: false,
            ribout_registered: false,
            ribout: None,
            ribout_index: None,
            action: Action::None,
            instance_id: -1,
            subscription_gen_id: 0,
            register_absorbed: false,
        }
    }
}

struct PeerState {
    tables: HashSet<TableRef>,
}

struct RibState {
    peer_rib_list: HashSet<PeerRef>,
    /// Edges batched into the next walk of this table.
    pending: HashSet<PeerRef>,
    request_count: u32,
    walk_count: u32,
}

impl RibState {
    fn new() -> Self {
        Self {
            peer_rib_list: HashSet::new(),
            pending: HashSet::new(),
            request_count: 0,
            walk_count: 0,
        }
    }
}

/// Join/leave bitsets for one ribout, read by the per-route walk callback.
struct RibOutState {
    ribout: Arc<RibOut>,
    join: BitSet,
    leave: BitSet,
}

/// Frozen context of the current walk; shared with the walk callbacks.
struct WalkContext {
    table: TableRef,
    ribout_states: Vec<RibOutState>,
    peers: Vec<PeerRef>,
}

struct CurrentWalk {
    table: TableRef,
    walk_ref: Option<WalkRef>,
    /// Edge actions snapshotted at walk start; completion events are
    /// posted per snapshot, not per live action.
    peer_rib_list: Vec<(PeerRef, Action)>,
    context: Arc<WalkContext>,
}

struct WalkerState {
    rib_fifo: VecDeque<TableRef>,
    rib_set: HashSet<TableRef>,
    walk_started: bool,
    disabled: bool,
    current: Option<CurrentWalk>,
}

impl WalkerState {
    fn new() -> Self {
        Self {
            rib_fifo: VecDeque::new(),
            rib_set: HashSet::new(),
            walk_started: false,
            disabled: false,
            current: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.rib_fifo.is_empty() && !self.walk_started && self.current.is_none()
    }
}

type EdgeKey = (PeerRef, TableRef);

struct Inner {
    peers: HashMap<PeerRef, PeerState>,
    ribs: HashMap<TableRef, RibState>,
    edges: HashMap<EdgeKey, PeerRibState>,
    walker: WalkerState,
    registration_callbacks: Vec<Option<PeerRegistrationCallback>>,
    registration_free: BitSet,
}

pub struct MembershipManager {
    sender: Arc<UpdateSender>,
    inner: RwLock<Inner>,
    event_tx: flume::Sender<Event>,
    event_rx: flume::Receiver<Event>,
    current_jobs: AtomicUsize,
    total_jobs: AtomicUsize,
}

impl MembershipManager {
    #[must_use]
    pub fn new(sender: Arc<UpdateSender>) -> Arc<Self> {
        let (event_tx, event_rx) = flume::unbounded();
        Arc::new(Self {
            sender,
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
                ribs: HashMap::new(),
                edges: HashMap::new(),
                walker: WalkerState::new(),
                registration_callbacks: Vec::new(),
                registration_free: BitSet::new(),
            }),
            event_tx,
            event_rx,
            current_jobs: AtomicUsize::new(0),
            total_jobs: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn sender(&self) -> &Arc<UpdateSender> {
        &self.sender
    }

    #[must_use]
    pub fn config(&self) -> &Arc<CoreConfig> {
        self.sender.config()
    }

    // ---- API entry points (control tasks) ----

    /// Register a peer to a table for both RibIn and RibOut.
    pub fn register(
        &self,
        peer: &PeerRef,
        table: &TableRef,
        policy: &RibExportPolicy,
        instance_id: i32,
    ) {
        task::check(&[tasks::CONTROL]);
        self.start_job();
        {
            let mut inner = self.inner.write();
            let prs = Self::locate_edge(&mut inner, peer, table);
            assert_eq!(prs.action, Action::None);
            assert!(!prs.ribout_registered);
            prs.ribin_registered = true;
            prs.action = Action::RibOutAdd;
        }
        debug!(
            "[MEMBERSHIP] register {} to {} requested",
            peer.name(),
            table.name()
        );
        let _ = self.event_tx.send(Event::RegisterRib {
            peer: peer.clone(),
            table: table.clone(),
            policy: policy.clone(),
            instance_id,
        });
    }

    /// Synchronously register a peer to a table for RibIn only.
    pub fn register_rib_in(&self, peer: &PeerRef, table: &TableRef) {
        task::check(&[tasks::CONTROL]);
        let mut inner = self.inner.write();
        let prs = Self::locate_edge(&mut inner, peer, table);
        assert_eq!(prs.action, Action::None);
        assert!(!prs.ribin_registered || peer.in_gr_timer_wait());
        assert!(!prs.ribout_registered);
        prs.ribin_registered = true;
    }

    /// Unregister a peer from a table.
    ///
    /// Legal while a register is still in flight: the unregister absorbs
    /// it, and the pending join resolves to a leave in a single walk.
    pub fn unregister(&self, peer: &PeerRef, table: &TableRef) {
        task::check(&[tasks::CONTROL]);
        self.start_job();
        let mut inner = self.inner.write();
        let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
        assert!(prs.action == Action::None || prs.action == Action::RibOutAdd);
        assert!(prs.ribin_registered);

        if prs.action == Action::RibOutAdd {
            prs.register_absorbed = true;
        } else if !prs.ribout_registered {
            Self::unregister_rib_in_locked(&mut inner, peer, table);
            drop(inner);
            let _ = self.event_tx.send(Event::WalkTrigger);
            return;
        }
        let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
        prs.ribin_registered = false;
        prs.instance_id = -1;
        prs.subscription_gen_id = 0;
        prs.action = Action::RibInDeleteRibOutDelete;
        drop(inner);
        debug!(
            "[MEMBERSHIP] unregister {} from {} requested",
            peer.name(),
            table.name()
        );
        let _ = self.event_tx.send(Event::UnregisterRib {
            peer: peer.clone(),
            table: table.clone(),
        });
    }

    /// Unregister the RibIn-only registration of a peer.
    pub fn unregister_rib_in(&self, peer: &PeerRef, table: &TableRef) {
        task::check(&[tasks::CONTROL]);
        self.start_job();
        let mut inner = self.inner.write();
        {
            let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
            assert_eq!(prs.action, Action::None);
            assert!(prs.ribin_registered && !prs.ribout_registered);
        }
        Self::unregister_rib_in_locked(&mut inner, peer, table);
        drop(inner);
        let _ = self.event_tx.send(Event::WalkTrigger);
    }

    /// Tear down only the RibOut half; used for graceful restart, where
    /// received routes must survive the session.
    pub fn unregister_rib_out(&self, peer: &PeerRef, table: &TableRef) {
        task::check(&[tasks::CONTROL]);
        self.start_job();
        {
            let mut inner = self.inner.write();
            let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
            assert_eq!(prs.action, Action::None);
            assert!(prs.ribin_registered);
            assert!(prs.ribout_registered);
            prs.instance_id = -1;
            prs.subscription_gen_id = 0;
            prs.action = Action::RibInWalkRibOutDelete;
        }
        let _ = self.event_tx.send(Event::UnregisterRib {
            peer: peer.clone(),
            table: table.clone(),
        });
    }

    /// Walk the peer's RibIn for the table, e.g. to sweep stale paths
    /// after graceful restart.
    pub fn walk_rib_in(&self, peer: &PeerRef, table: &TableRef) {
        task::check(&[tasks::CONTROL]);
        self.start_job();
        let mut inner = self.inner.write();
        {
            let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
            assert_eq!(prs.action, Action::None);
            assert!(prs.ribin_registered);
            prs.action = Action::RibInWalk;
        }
        Self::enqueue_pending(&mut inner, peer, table);
        let need_trigger = !inner.walker.walk_started;
        drop(inner);
        debug!(
            "[MEMBERSHIP] walk of {} for {} requested",
            table.name(),
            peer.name()
        );
        if need_trigger {
            let _ = self.event_tx.send(Event::WalkTrigger);
        }
    }

    // ---- Queries (any task, reader lock) ----

    /// Registration info for an edge; None if the peer is not registered.
    #[must_use]
    pub fn registration_info(&self, peer: &PeerRef, table: &TableRef) -> Option<(i32, u64)> {
        let inner = self.inner.read();
        let prs = inner.edges.get(&(peer.clone(), table.clone()))?;
        Some((prs.instance_id, prs.subscription_gen_id))
    }

    pub fn set_registration_info(
        &self,
        peer: &PeerRef,
        table: &TableRef,
        instance_id: i32,
        subscription_gen_id: u64,
    ) {
        let mut inner = self.inner.write();
        if let Some(prs) = inner.edges.get_mut(&(peer.clone(), table.clone())) {
            prs.instance_id = instance_id;
            prs.subscription_gen_id = subscription_gen_id;
        }
    }

    #[must_use]
    pub fn is_registered(&self, peer: &PeerRef, table: &TableRef) -> bool {
        let inner = self.inner.read();
        inner
            .edges
            .get(&(peer.clone(), table.clone()))
            .is_some_and(|prs| prs.ribin_registered && prs.ribout_registered)
    }

    #[must_use]
    pub fn is_rib_in_registered(&self, peer: &PeerRef, table: &TableRef) -> bool {
        let inner = self.inner.read();
        inner
            .edges
            .get(&(peer.clone(), table.clone()))
            .is_some_and(|prs| prs.ribin_registered)
    }

    #[must_use]
    pub fn is_rib_out_registered(&self, peer: &PeerRef, table: &TableRef) -> bool {
        let inner = self.inner.read();
        inner
            .edges
            .get(&(peer.clone(), table.clone()))
            .is_some_and(|prs| prs.ribout_registered)
    }

    /// Pending update entries on the edge's ribout.
    #[must_use]
    pub fn rib_out_queue_depth(&self, peer: &PeerRef, table: &TableRef) -> u32 {
        let inner = self.inner.read();
        inner
            .edges
            .get(&(peer.clone(), table.clone()))
            .filter(|prs| prs.ribout_registered)
            .and_then(|prs| prs.ribout.as_ref())
            .map_or(0, |ribout| ribout.queue_depth())
    }

    /// Tables the peer holds any registration in.
    #[must_use]
    pub fn registered_rib_list(&self, peer: &PeerRef) -> Vec<TableRef> {
        let inner = self.inner.read();
        inner
            .peers
            .get(peer)
            .map(|ps| ps.tables.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live `(peer, table)` edges.
    #[must_use]
    pub fn membership_count(&self) -> usize {
        self.inner.read().edges.len()
    }

    /// True when neither the event queue nor the walker has pending work.
    #[must_use]
    pub fn is_queue_empty(&self) -> bool {
        self.event_rx.is_empty() && self.inner.read().walker.is_idle()
    }

    /// Hold back walk starts so requests accumulate into one batch.
    /// Testing hook.
    pub fn set_walker_disabled(&self, disabled: bool) {
        self.inner.write().walker.disabled = disabled;
        if !disabled {
            let _ = self.event_tx.send(Event::WalkTrigger);
        }
    }

    #[must_use]
    pub fn current_jobs(&self) -> usize {
        self.current_jobs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_jobs(&self) -> usize {
        self.total_jobs.load(Ordering::Relaxed)
    }

    // ---- Peer registration listeners ----

    /// Register a listener for XMPP peer registration changes; ids of
    /// unregistered listeners are reused.
    pub fn register_peer_registration_callback(&self, callback: PeerRegistrationCallback) -> usize {
        let mut inner = self.inner.write();
        match inner.registration_free.find_first() {
            Some(id) => {
                inner.registration_free.reset(id);
                inner.registration_callbacks[id] = Some(callback);
                id
            }
            None => {
                inner.registration_callbacks.push(Some(callback));
                inner.registration_callbacks.len() - 1
            }
        }
    }

    pub fn unregister_peer_registration_callback(&self, id: usize) {
        let mut inner = self.inner.write();
        inner.registration_callbacks[id] = None;
        if id == inner.registration_callbacks.len() - 1 {
            while inner
                .registration_callbacks
                .last()
                .is_some_and(Option::is_none)
            {
                inner.registration_callbacks.pop();
            }
            let len = inner.registration_callbacks.len();
            let stale: Vec<usize> = inner
                .registration_free
                .ones()
                .filter(|bit| *bit >= len)
                .collect();
            for bit in stale {
                inner.registration_free.reset(bit);
            }
        } else {
            inner.registration_free.set(id);
        }
    }

    // ---- Introspect ----

    #[must_use]
    pub fn peer_membership_info(&self, peer: &PeerRef) -> PeerMembershipInfo {
        let _scope = TaskScope::enter(tasks::SHOW);
        let send_state = if self.sender.peer_is_registered(peer) {
            if self.sender.peer_in_sync(peer) {
                "in sync"
            } else {
                "not in sync"
            }
        } else {
            "not advertising"
        };
        let inner = self.inner.read();
        let mut routing_tables: Vec<RoutingTableInfo> = inner
            .peers
            .get(peer)
            .map(|ps| {
                ps.tables
                    .iter()
                    .map(|table| RoutingTableInfo {
                        name: table.name().to_string(),
                        current_state: "subscribed".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        routing_tables.sort_by(|a, b| a.name.cmp(&b.name));
        PeerMembershipInfo {
            send_state: send_state.to_string(),
            routing_tables,
        }
    }

    #[must_use]
    pub fn table_membership_info(&self, table: &TableRef) -> Option<TableMembershipInfo> {
        let _scope = TaskScope::enter(tasks::SHOW);
        let inner = self.inner.read();
        let rs = inner.ribs.get(table)?;
        let mut peers: Vec<MembershipPeerInfo> = rs
            .peer_rib_list
            .iter()
            .filter_map(|peer| {
                let prs = inner.edges.get(&(peer.clone(), table.clone()))?;
                Some(MembershipPeerInfo {
                    peer: peer.name().to_string(),
                    ribin_registered: prs.ribin_registered,
                    ribout_registered: prs.ribout_registered,
                    instance_id: prs.instance_id,
                    generation_id: prs.subscription_gen_id,
                })
            })
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        Some(TableMembershipInfo {
            requests: rs.request_count,
            walks: rs.walk_count,
            peers,
        })
    }

    // ---- Event processing (membership task) ----

    /// Drain every queued event; deterministic driver for tests and
    /// single-threaded embedders.
    pub fn process_pending(&self) {
        while let Ok(event) = self.event_rx.try_recv() {
            let _scope = TaskScope::enter(tasks::MEMBERSHIP);
            self.dispatch(event);
        }
    }

    /// Run the membership task until the manager is dropped.
    pub async fn run(&self) {
        while let Ok(event) = self.event_rx.recv_async().await {
            let _scope = TaskScope::enter(tasks::MEMBERSHIP);
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: Event) {
        match event {
            Event::RegisterRib {
                peer,
                table,
                policy,
                instance_id,
            } => self.handle_register_rib(&peer, &table, &policy, instance_id),
            Event::RegisterRibComplete { peer, table } => {
                self.handle_register_rib_complete(&peer, &table);
            }
            Event::UnregisterRib { peer, table } => self.handle_unregister_rib(&peer, &table),
            Event::UnregisterRibComplete { peer, table } => {
                self.handle_unregister_rib_complete(&peer, &table);
            }
            Event::WalkRibComplete { peer, table } => self.handle_walk_rib_complete(&peer, &table),
            Event::WalkDone { table } => self.handle_walk_done(&table),
            Event::WalkTrigger => self.maybe_start_walk(),
        }
    }

    fn handle_register_rib(
        &self,
        peer: &PeerRef,
        table: &TableRef,
        policy: &RibExportPolicy,
        instance_id: i32,
    ) {
        let mut deferred = Vec::new();
        let mut need_trigger = false;
        {
            let mut inner = self.inner.write();
            let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
            if prs.register_absorbed {
                // The unregister event will tear everything down; complete
                // the register here without creating a ribout.
                debug_assert_eq!(prs.action, Action::RibInDeleteRibOutDelete);
                prs.register_absorbed = false;
                prs.ribout_registered = true;
                deferred.push(Deferred::RequestCallback {
                    peer: peer.clone(),
                    table: table.clone(),
                });
                self.finish_job();
            } else {
                assert_eq!(prs.action, Action::RibOutAdd);
                assert!(prs.ribin_registered);
                prs.instance_id = instance_id;

                if table.is_deleted() {
                    // Accepted as a no-op that still completes: mark the
                    // ribout as registered even though none is created.
                    prs.ribout_registered = true;
                    prs.action = Action::None;
                    deferred.push(Deferred::RequestCallback {
                        peer: peer.clone(),
                        table: table.clone(),
                    });
                    self.finish_job();
                } else {
                    let ribout = table.ribout_locate(&self.sender, policy);
                    ribout.register_listener();
                    ribout.register(peer);
                    let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
                    prs.ribout_index = ribout.peer_index(peer);
                    debug_assert!(prs.ribout_index.is_some());
                    prs.ribout = Some(ribout);
                    prs.ribout_registered = true;
                    Self::enqueue_pending(&mut inner, peer, table);
                    need_trigger = !inner.walker.walk_started;
                }
            }
        }
        debug!(
            "[MEMBERSHIP] register of {} to {} processed",
            peer.name(),
            table.name()
        );
        self.run_deferred(deferred);
        if need_trigger {
            let _ = self.event_tx.send(Event::WalkTrigger);
        }
    }

    fn handle_register_rib_complete(&self, peer: &PeerRef, table: &TableRef) {
        let mut deferred = Vec::new();
        {
            let mut inner = self.inner.write();
            let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
            if prs.action == Action::RibOutAdd {
                assert!(prs.ribin_registered);
                assert!(prs.ribout_registered);
                prs.action = Action::None;
                deferred.push(Deferred::RequestCallback {
                    peer: peer.clone(),
                    table: table.clone(),
                });
                deferred.push(Deferred::RegistrationNotify {
                    peer: peer.clone(),
                    table: table.clone(),
                    unregister: false,
                });
                self.finish_job();
            } else {
                // The register was absorbed by an unregister mid-walk; its
                // completion already fired there.
                debug_assert!(!prs.register_absorbed);
            }
        }
        debug!(
            "[MEMBERSHIP] register of {} to {} completed",
            peer.name(),
            table.name()
        );
        self.run_deferred(deferred);
    }

    fn handle_unregister_rib(&self, peer: &PeerRef, table: &TableRef) {
        let mut deferred = Vec::new();
        let mut completion = None;
        let mut need_trigger = false;
        {
            let mut inner = self.inner.write();
            let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
            assert!(
                prs.action == Action::RibInDeleteRibOutDelete
                    || prs.action == Action::RibInWalkRibOutDelete
            );
            if prs.action == Action::RibInDeleteRibOutDelete {
                assert!(!prs.ribin_registered);
            } else {
                assert!(prs.ribin_registered);
            }
            assert!(prs.ribout_registered);

            if prs.register_absorbed {
                // The absorbed register completes now, before its teardown.
                prs.register_absorbed = false;
                deferred.push(Deferred::RequestCallback {
                    peer: peer.clone(),
                    table: table.clone(),
                });
                self.finish_job();
            }

            let ribout = Self::find_edge(&mut inner, peer, table)
                .expect("edge registered")
                .ribout
                .clone();
            if let Some(ribout) = ribout {
                // Stop exports now; leave processing runs in the walk.
                ribout.deactivate(peer);
                Self::enqueue_pending(&mut inner, peer, table);
                need_trigger = !inner.walker.walk_started;
            } else {
                // Register hit a deleted table, so there is nothing to
                // walk; complete directly.
                let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
                debug_assert!(prs.ribout_index.is_none());
                prs.ribout_registered = false;
                completion = Some(Event::UnregisterRibComplete {
                    peer: peer.clone(),
                    table: table.clone(),
                });
            }
        }
        debug!(
            "[MEMBERSHIP] unregister of {} from {} processed",
            peer.name(),
            table.name()
        );
        self.run_deferred(deferred);
        if let Some(event) = completion {
            let _ = self.event_tx.send(event);
        }
        if need_trigger {
            let _ = self.event_tx.send(Event::WalkTrigger);
        }
    }

    fn handle_unregister_rib_complete(&self, peer: &PeerRef, table: &TableRef) {
        let mut deferred = Vec::new();
        {
            let mut inner = self.inner.write();
            let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
            assert!(
                prs.action == Action::RibInDeleteRibOutDelete
                    || prs.action == Action::RibInWalkRibOutDelete
            );
            if prs.action == Action::RibInDeleteRibOutDelete {
                assert!(!prs.ribin_registered);
            } else {
                assert!(prs.ribin_registered);
            }

            let ribout = prs.ribout.take();
            if ribout.is_some() {
                assert!(prs.ribout_index.is_some());
            }
            prs.ribout_index = None;
            prs.ribout_registered = false;
            prs.action = Action::None;
            let destroy = !prs.ribin_registered;

            if let Some(ribout) = ribout {
                ribout.unregister(peer);
            }
            if destroy {
                Self::destroy_edge(&mut inner, peer, table);
            }
            deferred.push(Deferred::RequestCallback {
                peer: peer.clone(),
                table: table.clone(),
            });
            deferred.push(Deferred::RegistrationNotify {
                peer: peer.clone(),
                table: table.clone(),
                unregister: true,
            });
            self.finish_job();
        }
        debug!(
            "[MEMBERSHIP] unregister of {} from {} completed",
            peer.name(),
            table.name()
        );
        self.run_deferred(deferred);
    }

    fn handle_walk_rib_complete(&self, peer: &PeerRef, table: &TableRef) {
        let mut deferred = Vec::new();
        {
            let mut inner = self.inner.write();
            let prs = Self::find_edge(&mut inner, peer, table).expect("edge registered");
            assert!(prs.action == Action::RibInWalk || prs.action == Action::RibInDelete);
            if prs.action == Action::RibInWalk {
                assert!(prs.ribin_registered);
            } else {
                assert!(!prs.ribin_registered);
            }
            prs.action = Action::None;
            if !prs.ribin_registered && !prs.ribout_registered {
                Self::destroy_edge(&mut inner, peer, table);
            }
            deferred.push(Deferred::RequestCallback {
                peer: peer.clone(),
                table: table.clone(),
            });
            self.finish_job();
        }
        debug!(
            "[MEMBERSHIP] walk of {} for {} completed",
            table.name(),
            peer.name()
        );
        self.run_deferred(deferred);
    }

    fn handle_walk_done(&self, table: &TableRef) {
        let (walk_ref, completions) = {
            let mut inner = self.inner.write();
            let current = inner.walker.current.take().expect("walk in flight");
            debug_assert_eq!(&current.table, table);
            debug_assert!(
                !current.context.peers.is_empty() || !current.context.ribout_states.is_empty()
            );

            let completions: Vec<Event> = current
                .peer_rib_list
                .iter()
                .map(|(peer, action)| match action {
                    Action::RibOutAdd => Event::RegisterRibComplete {
                        peer: peer.clone(),
                        table: table.clone(),
                    },
                    Action::RibInDelete | Action::RibInWalk => Event::WalkRibComplete {
                        peer: peer.clone(),
                        table: table.clone(),
                    },
                    Action::RibInWalkRibOutDelete | Action::RibInDeleteRibOutDelete => {
                        Event::UnregisterRibComplete {
                            peer: peer.clone(),
                            table: table.clone(),
                        }
                    }
                    Action::None => unreachable!("walked edge without action"),
                })
                .collect();

            inner.walker.walk_started = false;
            (current.walk_ref, completions)
        };
        trace!("[MEMBERSHIP] walk of {} finished", table.name());
        if let Some(walk_ref) = walk_ref {
            table.release_walker(walk_ref);
        }
        for event in completions {
            let _ = self.event_tx.send(event);
        }
        self.maybe_start_walk();
    }

    /// Start a walk for the next table with ready pending edges, if the
    /// walker is idle.
    fn maybe_start_walk(&self) {
        let prepared = {
            let mut inner = self.inner.write();
            if inner.walker.walk_started || inner.walker.disabled {
                return;
            }
            self.prepare_walk(&mut inner)
        };
        let Some((table, entry_cb, done_cb)) = prepared else {
            return;
        };

        let walk_ref = table.alloc_walker(entry_cb, done_cb);
        {
            let mut inner = self.inner.write();
            inner
                .walker
                .current
                .as_mut()
                .expect("walk being started")
                .walk_ref = Some(walk_ref);
        }
        debug!("[MEMBERSHIP] walking {}", table.name());
        table.walk_table(&walk_ref);
    }

    /// Pick the next table, snapshot its ready pending edges and freeze
    /// the walk context. Edges whose absorbing unregister has not been
    /// processed yet stay pending for the next batch.
    fn prepare_walk(&self, inner: &mut Inner) -> Option<(TableRef, EntryWalkFn, DoneWalkFn)> {
        loop {
            let table = inner.walker.rib_fifo.pop_front()?;
            inner.walker.rib_set.remove(&table);
            let Some(rs) = inner.ribs.get_mut(&table) else {
                continue;
            };

            let ready: Vec<PeerRef> = rs
                .pending
                .iter()
                .filter(|peer| {
                    inner
                        .edges
                        .get(&((*peer).clone(), table.clone()))
                        .map_or(false, |prs| !prs.register_absorbed)
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                continue;
            }
            let rs = inner.ribs.get_mut(&table).expect("rib state");
            for peer in &ready {
                rs.pending.remove(peer);
            }
            rs.walk_count += 1;

            let mut peer_rib_list = Vec::with_capacity(ready.len());
            let mut ribout_states: Vec<RibOutState> = Vec::new();
            let mut walk_peers: Vec<PeerRef> = Vec::new();
            for peer in ready {
                let prs = inner
                    .edges
                    .get(&(peer.clone(), table.clone()))
                    .expect("pending edge");
                peer_rib_list.push((peer.clone(), prs.action));
                match prs.action {
                    Action::RibOutAdd => {
                        let index = prs.ribout_index.expect("registered ribout index");
                        let ribout = prs.ribout.clone().expect("registered ribout");
                        Self::locate_ribout_state(&mut ribout_states, ribout)
                            .join
                            .set(index);
                    }
                    Action::RibInDelete | Action::RibInWalk => {
                        walk_peers.push(peer.clone());
                    }
                    Action::RibInWalkRibOutDelete | Action::RibInDeleteRibOutDelete => {
                        walk_peers.push(peer.clone());
                        let index = prs.ribout_index.expect("registered ribout index");
                        let ribout = prs.ribout.clone().expect("registered ribout");
                        Self::locate_ribout_state(&mut ribout_states, ribout)
                            .leave
                            .set(index);
                    }
                    Action::None => unreachable!("pending edge without action"),
                }
            }

            let context = Arc::new(WalkContext {
                table: table.clone(),
                ribout_states,
                peers: walk_peers,
            });
            inner.walker.current = Some(CurrentWalk {
                table: table.clone(),
                walk_ref: None,
                peer_rib_list,
                context: context.clone(),
            });
            inner.walker.walk_started = true;

            let entry_ctx = context;
            let entry_cb: EntryWalkFn = Arc::new(move |partition, route| {
                let _scope = TaskScope::enter(tasks::TABLE_PARTITION);
                for ros in &entry_ctx.ribout_states {
                    let export = ros.ribout.bgp_export();
                    export.join(partition, &ros.join, route);
                    export.leave(partition, &ros.leave, route);
                }
                if entry_ctx.peers.is_empty() {
                    return;
                }
                let mut notify = false;
                for path in route.paths() {
                    if path.flags.resolved || path.secondary {
                        continue;
                    }
                    let Some(peer) = &path.peer else {
                        continue;
                    };
                    if !entry_ctx.peers.contains(peer) {
                        continue;
                    }
                    notify |= peer.membership_path_callback(partition, route, &path);
                }
                entry_ctx
                    .table
                    .input_common_post_process(partition, route, notify);
            });

            let done_tx = self.event_tx.clone();
            let done_table = table.clone();
            let done_cb: DoneWalkFn = Arc::new(move || {
                let _scope = TaskScope::enter(tasks::TABLE_WALKER);
                let _ = done_tx.send(Event::WalkDone {
                    table: done_table.clone(),
                });
            });

            return Some((table, entry_cb, done_cb));
        }
    }

    fn locate_ribout_state(states: &mut Vec<RibOutState>, ribout: Arc<RibOut>) -> &mut RibOutState {
        if let Some(pos) = states
            .iter()
            .position(|ros| Arc::ptr_eq(&ros.ribout, &ribout))
        {
            return &mut states[pos];
        }
        states.push(RibOutState {
            ribout,
            join: BitSet::new(),
            leave: BitSet::new(),
        });
        states.last_mut().expect("just pushed")
    }

    // ---- Internals ----

    fn locate_edge<'a>(inner: &'a mut Inner, peer: &PeerRef, table: &TableRef) -> &'a mut PeerRibState {
        inner
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerState {
                tables: HashSet::new(),
            })
            .tables
            .insert(table.clone());
        inner
            .ribs
            .entry(table.clone())
            .or_insert_with(RibState::new)
            .peer_rib_list
            .insert(peer.clone());
        inner
            .edges
            .entry((peer.clone(), table.clone()))
            .or_insert_with(PeerRibState::new)
    }

    fn find_edge<'a>(
        inner: &'a mut Inner,
        peer: &PeerRef,
        table: &TableRef,
    ) -> Option<&'a mut PeerRibState> {
        inner.edges.get_mut(&(peer.clone(), table.clone()))
    }

    /// Batch the edge into the next walk of its table.
    fn enqueue_pending(inner: &mut Inner, peer: &PeerRef, table: &TableRef) {
        let rs = inner.ribs.get_mut(table).expect("rib state");
        rs.request_count += 1;
        rs.pending.insert(peer.clone());
        if inner.walker.rib_set.insert(table.clone()) {
            inner.walker.rib_fifo.push_back(table.clone());
        }
    }

    fn unregister_rib_in_locked(inner: &mut Inner, peer: &PeerRef, table: &TableRef) {
        let prs = Self::find_edge(inner, peer, table).expect("edge registered");
        prs.ribin_registered = false;
        prs.instance_id = -1;
        prs.subscription_gen_id = 0;
        prs.action = Action::RibInDelete;
        Self::enqueue_pending(inner, peer, table);
        debug!(
            "[MEMBERSHIP] ribin unregister of {} from {} requested",
            peer.name(),
            table.name()
        );
    }

    fn destroy_edge(inner: &mut Inner, peer: &PeerRef, table: &TableRef) {
        let prs = inner
            .edges
            .remove(&(peer.clone(), table.clone()))
            .expect("edge exists");
        debug_assert_eq!(prs.action, Action::None);
        debug_assert!(!prs.ribin_registered && !prs.ribout_registered);
        debug_assert!(prs.ribout.is_none() && prs.ribout_index.is_none());

        if let Some(ps) = inner.peers.get_mut(peer) {
            ps.tables.remove(table);
            if ps.tables.is_empty() {
                inner.peers.remove(peer);
            }
        }
        if let Some(rs) = inner.ribs.get_mut(table) {
            rs.peer_rib_list.remove(peer);
            if rs.peer_rib_list.is_empty() && rs.pending.is_empty() {
                inner.ribs.remove(table);
            }
        }
    }

    fn run_deferred(&self, deferred: Vec<Deferred>) {
        for item in deferred {
            match item {
                Deferred::RequestCallback { peer, table } => {
                    peer.membership_request_callback(&table);
                }
                Deferred::RegistrationNotify {
                    peer,
                    table,
                    unregister,
                } => {
                    self.notify_peer_registration(&peer, &table, unregister);
                }
            }
        }
    }

    fn notify_peer_registration(&self, peer: &PeerRef, table: &TableRef, unregister: bool) {
        if !peer.is_xmpp() {
            return;
        }
        let callbacks: Vec<PeerRegistrationCallback> = {
            let inner = self.inner.read();
            inner
                .registration_callbacks
                .iter()
                .flatten()
                .cloned()
                .collect()
        };
        for callback in callbacks {
            callback(peer, table, unregister);
        }
    }

    fn start_job(&self) {
        self.current_jobs.fetch_add(1, Ordering::Relaxed);
        self.total_jobs.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_job(&self) {
        self.current_jobs.fetch_sub(1, Ordering::Relaxed);
    }
}
